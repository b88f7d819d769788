//! Per-sensor resume points (`sync_state`).

use crate::db::models::SyncState;
use crate::models::orion::SensorId;
use crate::schema;
use chrono::{Duration, NaiveDateTime};
use diesel::PgConnection;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamp};
use log::{debug, info};
use std::collections::BTreeMap;

pub trait WatermarkStore {
    /// Last committed timestamp for every sensor that has one.
    fn stored_watermarks(&mut self) -> Result<BTreeMap<SensorId, NaiveDateTime>, String>;
}

impl WatermarkStore for PgConnection {
    fn stored_watermarks(&mut self) -> Result<BTreeMap<SensorId, NaiveDateTime>, String> {
        use schema::leituras::dsl as L;
        use schema::sync_state::dsl as W;

        let mut marks: BTreeMap<SensorId, NaiveDateTime> = W::sync_state
            .select(SyncState::as_select())
            .load::<SyncState>(self)
            .map_err(|e| format!("load sync_state failed: {}", e))?
            .into_iter()
            .map(|row| (SensorId(row.sensor_id), row.last_timestamp))
            .collect();

        // sensors ingested before sync_state existed resume from their newest reading
        let latest: Vec<(i64, Option<NaiveDateTime>)> = L::leituras
            .group_by(L::sensor_id)
            .select((L::sensor_id, max(L::data_leitura)))
            .load(self)
            .map_err(|e| format!("load latest readings failed: {}", e))?;
        let mut seeded = 0usize;
        for (id, ts) in latest {
            if let Some(ts) = ts
                && !marks.contains_key(&SensorId(id))
            {
                marks.insert(SensorId(id), ts);
                seeded += 1;
            }
        }
        if seeded > 0 {
            debug!("Watermarks: seeded {} sensor(s) from existing readings", seeded);
        }
        Ok(marks)
    }
}

/// Move a sensor's watermark forward to `ts`. `GREATEST` keeps the stored value
/// when `ts` is older, so a watermark never regresses.
pub fn advance_watermark(conn: &mut PgConnection, sensor: SensorId, ts: NaiveDateTime) -> QueryResult<()> {
    diesel::sql_query(
        "INSERT INTO sync_state (sensor_id, last_timestamp) VALUES ($1, $2) \
         ON CONFLICT (sensor_id) DO UPDATE \
         SET last_timestamp = GREATEST(sync_state.last_timestamp, EXCLUDED.last_timestamp)",
    )
    .bind::<BigInt, _>(sensor.0)
    .bind::<Timestamp, _>(ts)
    .execute(conn)
    .map(|_| ())
}

/// Resume points for one run, already shifted back by the safety margin.
#[derive(Debug, Clone)]
pub struct Watermarks {
    resume: BTreeMap<SensorId, NaiveDateTime>,
    default_start: NaiveDateTime,
}

impl Watermarks {
    pub fn new(stored: BTreeMap<SensorId, NaiveDateTime>, margin: Duration, default_start: NaiveDateTime) -> Self {
        let resume = stored
            .into_iter()
            .map(|(id, ts)| (id, ts.checked_sub_signed(margin).unwrap_or(ts)))
            .collect();
        Watermarks { resume, default_start }
    }

    pub fn resume_point(&self, sensor: SensorId) -> NaiveDateTime {
        self.resume.get(&sensor).copied().unwrap_or(self.default_start)
    }

    /// Earliest resume point among `sensors`; the whole partition is fetched from there.
    pub fn window_start(&self, sensors: &[SensorId]) -> NaiveDateTime {
        sensors
            .iter()
            .map(|s| self.resume_point(*s))
            .min()
            .unwrap_or(self.default_start)
    }

    pub fn len(&self) -> usize {
        self.resume.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resume.is_empty()
    }
}

pub fn load<S: WatermarkStore>(
    store: &mut S,
    margin: Duration,
    default_start: NaiveDateTime,
) -> Result<Watermarks, String> {
    let stored = store.stored_watermarks()?;
    let marks = Watermarks::new(stored, margin, default_start);
    info!(
        "Watermarks: {} sensor(s) with stored progress (margin={}min, default start {})",
        marks.len(),
        margin.num_minutes(),
        default_start
    );
    Ok(marks)
}
