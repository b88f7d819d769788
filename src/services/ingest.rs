use crate::db::models::NewReading;
use crate::schema;
use crate::services::fetch::{PageBatch, ReadingSink};
use crate::services::watermarks::advance_watermark;
use diesel::PgConnection;
use diesel::prelude::*;

/// Rows per INSERT; 3 binds each keeps us far below the Postgres bind limit.
pub const INSERT_CHUNK_ROWS: usize = 1000;

/// Insert readings, silently skipping ones already stored. Returns rows actually inserted.
pub fn insert_readings(conn: &mut PgConnection, rows: &[NewReading]) -> QueryResult<usize> {
    use schema::leituras::dsl as L;

    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        inserted += diesel::insert_into(L::leituras)
            .values(chunk)
            .on_conflict((L::sensor_id, L::data_leitura))
            .do_nothing()
            .execute(conn)?;
    }
    Ok(inserted)
}

/// Readings and the watermarks they justify commit in one transaction.
impl ReadingSink for PgConnection {
    fn commit_page(&mut self, batch: &PageBatch) -> Result<usize, String> {
        self.transaction(|conn| {
            let inserted = insert_readings(conn, &batch.readings)?;
            for (sensor, ts) in &batch.advances {
                advance_watermark(conn, *sensor, *ts)?;
            }
            Ok::<_, diesel::result::Error>(inserted)
        })
        .map_err(|e| format!("commit page failed: {}", e))
    }
}
