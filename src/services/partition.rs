use crate::models::orion::{DeviceId, SensorId};
use crate::services::metadata::SensorsByDevice;
use std::fmt;

/// Sensors fetched and committed together by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub device_id: DeviceId,
    /// 0 unless the device had to be split.
    pub part: usize,
    pub sensors: Vec<SensorId>,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.part == 0 {
            write!(f, "device {}", self.device_id)
        } else {
            write!(f, "device {} part {}", self.device_id, self.part)
        }
    }
}

/// One partition per device; devices with more than `max_sensors` accepted
/// sensors are cut into consecutive chunks. The registrar hands over disjoint
/// sensor lists, so every sensor lands in exactly one partition.
pub fn partition(grouping: &SensorsByDevice, max_sensors: usize) -> Vec<Partition> {
    let chunk = max_sensors.max(1);
    let mut out = Vec::new();

    for (device_id, sensors) in grouping {
        for (part, sensors) in sensors.chunks(chunk).enumerate() {
            out.push(Partition {
                device_id: *device_id,
                part,
                sensors: sensors.to_vec(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn grouping(entries: &[(i64, &[i64])]) -> SensorsByDevice {
        entries
            .iter()
            .map(|(d, s)| (DeviceId(*d), s.iter().map(|id| SensorId(*id)).collect()))
            .collect()
    }

    #[test]
    fn one_partition_per_device() {
        let parts = partition(&grouping(&[(1, &[101, 102]), (2, &[201])]), 50);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].sensors, vec![SensorId(101), SensorId(102)]);
        assert_eq!(parts[1].device_id, DeviceId(2));
        assert_eq!(parts[0].to_string(), "device 1");
    }

    #[test]
    fn covers_every_sensor_exactly_once() {
        let g = grouping(&[(1, &[1, 2, 3, 4, 5]), (2, &[6]), (3, &[]), (4, &[7])]);
        let parts = partition(&g, 2);

        let mut counts: BTreeMap<SensorId, usize> = BTreeMap::new();
        for p in &parts {
            assert!(!p.sensors.is_empty());
            assert!(p.sensors.len() <= 2);
            for s in &p.sensors {
                *counts.entry(*s).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 7);
        assert!(counts.values().all(|c| *c == 1));
        assert_eq!(parts.iter().filter(|p| p.device_id == DeviceId(1)).count(), 3);
        assert_eq!(parts[2].to_string(), "device 1 part 2");
    }
}
