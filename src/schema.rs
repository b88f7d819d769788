//! Handwritten Diesel schema declarations matching `migrations/`.
//!
//! Column names follow the tables the dashboard already reads, hence the
//! Portuguese names on `sensores` and `leituras`.

diesel::table! {
    devices (device_id) {
        device_id -> BigInt,
        device_name -> Nullable<Text>,
        serial_number -> Nullable<Text>,
        status -> Nullable<Text>,
        latitude -> Nullable<Double>,
        longitude -> Nullable<Double>,
        last_upload -> Nullable<Timestamp>,
        battery_percentage -> Nullable<Double>,
    }
}

diesel::table! {
    sensores (sensor_id) {
        sensor_id -> BigInt,
        device_id -> BigInt,
        nome_customizado -> Nullable<Text>,
        tipo_sensor -> Nullable<Text>,
        unidade_medida -> Nullable<Text>,
    }
}

// UNIQUE (sensor_id, data_leitura) is the conflict target for inserts
diesel::table! {
    leituras (id) {
        id -> BigInt,
        sensor_id -> BigInt,
        data_leitura -> Timestamp,
        valor_sensor -> Double,
    }
}

diesel::table! {
    sync_state (sensor_id) {
        sensor_id -> BigInt,
        last_timestamp -> Timestamp,
    }
}

diesel::joinable!(sensores -> devices (device_id));
diesel::joinable!(leituras -> sensores (sensor_id));
diesel::joinable!(sync_state -> sensores (sensor_id));

diesel::allow_tables_to_appear_in_same_query!(devices, sensores, leituras, sync_state,);
