//! Diesel row types for the ingest tables.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema;

#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = schema::devices)]
#[diesel(primary_key(device_id))]
#[diesel(treat_none_as_null = true)]
pub struct NewDevice {
    pub device_id: i64,
    pub device_name: Option<String>,
    pub serial_number: Option<String>,
    pub status: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_upload: Option<NaiveDateTime>,
    pub battery_percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = schema::sensores)]
#[diesel(primary_key(sensor_id))]
#[diesel(treat_none_as_null = true)]
pub struct NewSensor {
    pub sensor_id: i64,
    pub device_id: i64,
    pub nome_customizado: Option<String>,
    pub tipo_sensor: Option<String>,
    pub unidade_medida: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = schema::leituras)]
pub struct NewReading {
    pub sensor_id: i64,
    pub data_leitura: NaiveDateTime,
    pub valor_sensor: f64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = schema::sync_state)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SyncState {
    pub sensor_id: i64,
    pub last_timestamp: NaiveDateTime,
}
