//! `.env` support: `--env-file <path>` on the command line, otherwise `./.env` if present.
//! Variables already set in the process environment always win.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct EnvFile {
    pub path: PathBuf,
    /// Named with `--env-file` rather than picked up from the working directory.
    pub explicit: bool,
    pub applied: usize,
}

/// Resolve the env file from CLI arguments (without the program name) and export its variables.
pub fn load_from_args<I>(args: I) -> Result<Option<EnvFile>, String>
where
    I: IntoIterator<Item = OsString>,
{
    let (path, explicit) = match env_file_arg(args)? {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            (path, true)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };

    let vars = read(&path)?;
    let mut applied = 0;
    for (key, value) in vars {
        if std::env::var_os(&key).is_none() {
            // The process is still single-threaded here.
            unsafe {
                std::env::set_var(key, value);
            }
            applied += 1;
        }
    }
    Ok(Some(EnvFile { path, explicit, applied }))
}

fn env_file_arg<I>(args: I) -> Result<Option<PathBuf>, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let Some(arg) = arg.to_str() else {
            return Err("argument contains invalid UTF-8".to_string());
        };
        let value = match arg {
            "--" => break,
            "--env-file" => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            _ => match arg.strip_prefix("--env-file=") {
                Some("") => return Err("`--env-file` requires a path argument".to_string()),
                Some(p) => PathBuf::from(p),
                None => return Err(format!("unrecognised argument: {}", arg)),
            },
        };
        if found.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

/// Parse a whole env file; errors carry `path:line`.
pub fn read(path: &Path) -> Result<Vec<(String, String)>, String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse(&contents).map_err(|(line, e)| format!("{}:{}: {}", path.display(), line, e))
}

pub fn parse(contents: &str) -> Result<Vec<(String, String)>, (usize, String)> {
    let mut out = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| (idx + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

/// `KEY=value`, `export KEY=value`, quoted values, `#` comments. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=').ok_or("missing '=' in assignment")?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let mut chars = raw.chars();
    let quote = match chars.next() {
        None => return Ok(String::new()),
        Some(q @ ('"' | '\'')) => q,
        Some(_) => {
            let unquoted = raw.split('#').next().unwrap_or_default();
            return Ok(unquoted.trim_end().to_string());
        }
    };

    let mut value = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quote == '"' => {
                let escaped = chars.next().ok_or("unterminated escape sequence in double-quoted value")?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = chars.as_str().trim();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(value);
                }
                return Err(format!("unexpected characters after closing {} quote", quote));
            }
            c => value.push(c),
        }
    }
    Err(format!("unterminated {}-quoted value", quote))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(k: &str, v: &str) -> Option<(String, String)> {
        Some((k.to_string(), v.to_string()))
    }

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn plain_and_exported_assignments() {
        assert_eq!(
            parse_line("DATABASE_URL=postgres://db/orion").unwrap(),
            pair("DATABASE_URL", "postgres://db/orion")
        );
        assert_eq!(parse_line("  export INGEST_WORKERS = 4 # six is too many").unwrap(), pair("INGEST_WORKERS", "4"));
        assert_eq!(parse_line("EMPTY=").unwrap(), pair("EMPTY", ""));
        assert_eq!(parse_line("# comment").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn quoted_values() {
        assert_eq!(parse_line(r#"ORION_API_KEY="a#b\"c\n""#).unwrap(), pair("ORION_API_KEY", "a#b\"c\n"));
        assert_eq!(parse_line(r"RUST_LOG='debug\n' # raw").unwrap(), pair("RUST_LOG", r"debug\n"));
    }

    #[test]
    fn malformed_lines() {
        assert!(parse_line("NO_EQUALS").is_err());
        assert!(parse_line("=value").is_err());
        assert!(parse_line("BAD KEY=1").is_err());
        assert!(parse_line(r#"K="open"#).is_err());
        assert!(parse_line(r#"K="closed" trailing"#).is_err());
        assert!(parse_line("K='open").is_err());
    }

    #[test]
    fn errors_report_line_numbers() {
        let err = parse("# header\nA=1\n\nB\n").unwrap_err();
        assert_eq!(err.0, 4);
        assert_eq!(parse("A=1\nB='2'\n").unwrap().len(), 2);
    }

    #[test]
    fn cli_arguments() {
        assert_eq!(env_file_arg(args(&[])).unwrap(), None);
        assert_eq!(env_file_arg(args(&["--env-file", "prod.env"])).unwrap(), Some(PathBuf::from("prod.env")));
        assert_eq!(env_file_arg(args(&["--env-file=a.env", "--", "x"])).unwrap(), Some(PathBuf::from("a.env")));
        assert!(env_file_arg(args(&["--env-file"])).is_err());
        assert!(env_file_arg(args(&["--env-file="])).is_err());
        assert!(env_file_arg(args(&["--env-file=a", "--env-file=b"])).is_err());
        assert!(env_file_arg(args(&["--verbose"])).is_err());
    }

    #[test]
    fn reads_fixture_file() {
        let vars = read(Path::new("tests/data/sample.env")).unwrap();
        assert!(vars.contains(&("ORION_BASE_URL".to_string(), "https://api.oriondata.io/api".to_string())));
        assert!(vars.contains(&("OFFSET_MODE".to_string(), "rows".to_string())));
    }
}
