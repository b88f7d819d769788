use crate::db::models::{NewDevice, NewSensor};
use crate::models::orion::{DeviceId, DeviceSensor, DeviceStatus, SensorId, UserDevice};
use crate::schema;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

/// Channels that carry tilt/temperature data on the monitoring devices.
pub const ALLOWED_CHANNELS: [u32; 3] = [1, 2, 3];

pub const ALLOWED_SENSOR_TYPES: [&str; 4] = [
    "A-Axis Delta Angle",
    "B-Axis Delta Angle",
    "Air Temperature",
    "Device Temperature",
];

/// Accepted sensor ids per device, in vendor order.
pub type SensorsByDevice = BTreeMap<DeviceId, Vec<SensorId>>;

/// Receives device connectivity transitions; implemented by the alerting side.
pub trait StatusListener: Sync {
    fn on_device_status_change(&self, device_id: DeviceId, old: &DeviceStatus, new: &DeviceStatus);
}

/// Default listener: the transition only shows up in the log.
pub struct LogStatusListener;

impl StatusListener for LogStatusListener {
    fn on_device_status_change(&self, device_id: DeviceId, old: &DeviceStatus, new: &DeviceStatus) {
        warn!("Metadata: device {} status changed {} -> {}", device_id, old, new);
    }
}

/// Persistence needed by the registrar. Upserts must be safe to repeat.
pub trait MetadataStore {
    fn stored_status(&mut self, device_id: DeviceId) -> Result<Option<String>, String>;
    fn upsert_device(&mut self, row: &NewDevice) -> Result<(), String>;
    fn upsert_sensor(&mut self, row: &NewSensor) -> Result<(), String>;
}

impl MetadataStore for PgConnection {
    fn stored_status(&mut self, device_id: DeviceId) -> Result<Option<String>, String> {
        use schema::devices::dsl as D;

        D::devices
            .filter(D::device_id.eq(device_id.0))
            .select(D::status)
            .first::<Option<String>>(self)
            .optional()
            .map(Option::flatten)
            .map_err(|e| format!("fetch status of device {} failed: {}", device_id, e))
    }

    fn upsert_device(&mut self, row: &NewDevice) -> Result<(), String> {
        use schema::devices::dsl as D;

        diesel::insert_into(D::devices)
            .values(row)
            .on_conflict(D::device_id)
            .do_update()
            .set(row)
            .execute(self)
            .map(|_| ())
            .map_err(|e| format!("upsert device {} failed: {}", row.device_id, e))
    }

    fn upsert_sensor(&mut self, row: &NewSensor) -> Result<(), String> {
        use schema::sensores::dsl as S;

        diesel::insert_into(S::sensores)
            .values(row)
            .on_conflict(S::sensor_id)
            .do_update()
            .set(row)
            .execute(self)
            .map(|_| ())
            .map_err(|e| format!("upsert sensor {} failed: {}", row.sensor_id, e))
    }
}

pub fn is_allowed_sensor(sensor: &DeviceSensor) -> bool {
    let channel_ok = sensor
        .channel_number
        .as_ref()
        .and_then(|c| c.number())
        .is_some_and(|n| ALLOWED_CHANNELS.contains(&n));
    let type_ok = sensor
        .sensor_type
        .as_deref()
        .is_some_and(|t| ALLOWED_SENSOR_TYPES.iter().any(|a| *a == t.trim()));
    channel_ok && type_ok
}

fn device_row(device: &UserDevice) -> NewDevice {
    NewDevice {
        device_id: device.device_id.0,
        device_name: device.device_name.clone(),
        serial_number: device.serial_number.clone(),
        status: Some(DeviceStatus::reported(device.status.as_deref()).as_str().to_string()),
        latitude: device.latitude,
        longitude: device.longitude,
        last_upload: device.last_upload,
        battery_percentage: device.battery_percentage,
    }
}

fn sensor_row(device_id: DeviceId, sensor: &DeviceSensor) -> NewSensor {
    let name = match sensor.custom_name.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => format!("Sensor {}", sensor.sensor_id),
    };
    NewSensor {
        sensor_id: sensor.sensor_id.0,
        device_id: device_id.0,
        nome_customizado: Some(name),
        tipo_sensor: sensor.sensor_type.as_ref().map(|t| t.trim().to_string()),
        unidade_medida: sensor.uom.clone(),
    }
}

/// Persist the vendor inventory and return the sensors worth ingesting.
///
/// A status event fires only when a previously stored status differs from the
/// newly observed one; a device seen for the first time is silent. A missing
/// status is observed as `unknown`. A sensor id listed under several devices
/// belongs to the first of them.
pub fn register<S: MetadataStore>(
    store: &mut S,
    devices: &[UserDevice],
    listener: &dyn StatusListener,
) -> Result<SensorsByDevice, String> {
    let mut grouping = SensorsByDevice::new();
    let mut claimed = BTreeSet::new();
    let mut rejected = 0usize;

    for device in devices {
        let previous = store.stored_status(device.device_id)?.map(|s| DeviceStatus::parse(&s));
        let observed = DeviceStatus::reported(device.status.as_deref());
        store.upsert_device(&device_row(device))?;

        if let Some(old) = previous
            && old != observed
        {
            listener.on_device_status_change(device.device_id, &old, &observed);
        }

        for sensor in &device.sensors {
            if !is_allowed_sensor(sensor) {
                debug!(
                    "Metadata: skipping sensor {} on device {} (channel={:?}, type={:?})",
                    sensor.sensor_id,
                    device.device_id,
                    sensor.channel_number.as_ref().map(|c| c.0.as_str()),
                    sensor.sensor_type
                );
                rejected += 1;
                continue;
            }
            if !claimed.insert(sensor.sensor_id) {
                warn!(
                    "Metadata: sensor {} listed again under device {}; keeping the first device",
                    sensor.sensor_id, device.device_id
                );
                continue;
            }
            store.upsert_sensor(&sensor_row(device.device_id, sensor))?;
            grouping.entry(device.device_id).or_default().push(sensor.sensor_id);
        }
    }

    info!(
        "Metadata: {} device(s), {} accepted sensor(s), {} rejected",
        devices.len(),
        grouping.values().map(Vec::len).sum::<usize>(),
        rejected
    );
    Ok(grouping)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryMetadata {
        pub devices: BTreeMap<i64, NewDevice>,
        pub sensors: BTreeMap<i64, NewSensor>,
    }

    impl MetadataStore for MemoryMetadata {
        fn stored_status(&mut self, device_id: DeviceId) -> Result<Option<String>, String> {
            Ok(self.devices.get(&device_id.0).and_then(|d| d.status.clone()))
        }

        fn upsert_device(&mut self, row: &NewDevice) -> Result<(), String> {
            self.devices.insert(row.device_id, row.clone());
            Ok(())
        }

        fn upsert_sensor(&mut self, row: &NewSensor) -> Result<(), String> {
            if !self.devices.contains_key(&row.device_id) {
                return Err(format!("device {} missing", row.device_id));
            }
            self.sensors.insert(row.sensor_id, row.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingListener {
        pub events: Mutex<Vec<(DeviceId, String, String)>>,
    }

    impl StatusListener for RecordingListener {
        fn on_device_status_change(&self, device_id: DeviceId, old: &DeviceStatus, new: &DeviceStatus) {
            self.events
                .lock()
                .unwrap()
                .push((device_id, old.as_str().to_string(), new.as_str().to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::orion::Channel;

    fn load_devices_fixture() -> Vec<UserDevice> {
        let json = std::fs::read_to_string("tests/data/user-devices.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse user devices")
    }

    fn sensor(id: i64, channel: &str, kind: &str) -> DeviceSensor {
        DeviceSensor {
            sensor_id: SensorId(id),
            channel_number: Some(Channel(channel.to_string())),
            sensor_type: Some(kind.to_string()),
            custom_name: None,
            uom: None,
        }
    }

    #[test]
    fn allow_list_requires_channel_and_type() {
        assert!(is_allowed_sensor(&sensor(1, "1", "A-Axis Delta Angle")));
        assert!(is_allowed_sensor(&sensor(1, "3", "Device Temperature")));
        assert!(!is_allowed_sensor(&sensor(1, "4", "A-Axis Delta Angle")));
        assert!(!is_allowed_sensor(&sensor(1, "2", "Strain")));

        let mut no_channel = sensor(1, "1", "Air Temperature");
        no_channel.channel_number = None;
        assert!(!is_allowed_sensor(&no_channel));
    }

    #[test]
    fn registers_only_allowed_sensors() {
        let mut store = MemoryMetadata::default();
        let listener = RecordingListener::default();
        let grouping = register(&mut store, &load_devices_fixture(), &listener).unwrap();

        assert_eq!(grouping[&DeviceId(1)], vec![SensorId(101), SensorId(102)]);
        assert_eq!(grouping[&DeviceId(2)], vec![SensorId(201), SensorId(204)]);
        assert_eq!(store.devices.len(), 2);
        assert!(!store.sensors.contains_key(&103), "channel 5 must not be persisted");
        assert!(!store.sensors.contains_key(&202), "unknown type must not be persisted");
        assert!(!store.sensors.contains_key(&203), "channel 4 must not be persisted");
        assert_eq!(store.sensors[&204].device_id, 2, "channel 2.0 is channel 2");
        for odd in [205, 206, 207] {
            assert!(!store.sensors.contains_key(&odd), "sensor {} has no usable channel", odd);
        }
        assert_eq!(store.sensors[&102].nome_customizado.as_deref(), Some("Sensor 102"));
        assert_eq!(store.devices[&1].status.as_deref(), Some("online"));
    }

    #[test]
    fn emits_event_only_on_status_change() {
        let mut store = MemoryMetadata::default();
        let listener = RecordingListener::default();
        let mut devices = load_devices_fixture();

        // first sight: nothing stored yet
        register(&mut store, &devices, &listener).unwrap();
        assert!(listener.events.lock().unwrap().is_empty());

        // same status, different case
        devices[0].status = Some("ONLINE".to_string());
        register(&mut store, &devices, &listener).unwrap();
        assert!(listener.events.lock().unwrap().is_empty());

        devices[0].status = Some("Offline".to_string());
        register(&mut store, &devices, &listener).unwrap();
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![(DeviceId(1), "online".to_string(), "offline".to_string())]
        );
    }

    #[test]
    fn missing_status_is_a_transition_to_unknown() {
        let mut store = MemoryMetadata::default();
        let listener = RecordingListener::default();
        let mut devices = load_devices_fixture();

        register(&mut store, &devices, &listener).unwrap();
        devices[0].status = None;
        register(&mut store, &devices, &listener).unwrap();
        assert_eq!(store.devices[&1].status.as_deref(), Some("unknown"));

        devices[0].status = Some("offline".to_string());
        register(&mut store, &devices, &listener).unwrap();
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![
                (DeviceId(1), "online".to_string(), "unknown".to_string()),
                (DeviceId(1), "unknown".to_string(), "offline".to_string()),
            ]
        );
    }

    #[test]
    fn sensor_under_two_devices_stays_with_the_first() {
        let mut store = MemoryMetadata::default();
        let mut devices = load_devices_fixture();
        let mut moved = devices[0].sensors[0].clone();
        moved.custom_name = Some("Moved".to_string());
        devices[1].sensors.push(moved);

        let grouping = register(&mut store, &devices, &LogStatusListener).unwrap();
        assert!(grouping[&DeviceId(1)].contains(&SensorId(101)));
        assert!(!grouping[&DeviceId(2)].contains(&SensorId(101)));
        assert_eq!(store.sensors[&101].device_id, 1);
        assert_eq!(store.sensors[&101].nome_customizado.as_deref(), Some("Tilt A"));
    }

    #[test]
    fn device_without_accepted_sensors_is_still_stored() {
        let mut store = MemoryMetadata::default();
        let mut devices = load_devices_fixture();
        devices[1].sensors.retain(|s| !is_allowed_sensor(s));

        let grouping = register(&mut store, &devices, &LogStatusListener).unwrap();
        assert!(!grouping.contains_key(&DeviceId(2)));
        assert!(store.devices.contains_key(&2));
    }
}
