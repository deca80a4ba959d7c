//! Presence tracking: decides which configured devices arrived or departed
//! between two scans and runs their actions exactly once per transition.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::actions::{ActionOutcome, ActionRunner};
use crate::config::DeviceConfig;
use crate::messages::{Device, PresenceChange};

/// What the engine retains about a present device. Only used for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresentDevice {
    pub name: String,
}

/// Owns the present set.
///
/// An address is present iff it matched a configured device in the most
/// recent scan. Addresses enter only through an arrival and leave only
/// through a departure.
pub struct PresenceEngine<R> {
    present: BTreeMap<String, PresentDevice>,
    runner: R,
}

impl<R: ActionRunner> PresenceEngine<R> {
    pub fn new(runner: R) -> Self {
        PresenceEngine {
            present: BTreeMap::new(),
            runner,
        }
    }

    #[cfg(test)]
    pub fn is_present(&self, address: &str) -> bool {
        self.present.contains_key(address)
    }

    pub fn present(&self) -> impl Iterator<Item = (&str, &PresentDevice)> {
        self.present
            .iter()
            .map(|(address, device)| (address.as_str(), device))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    #[cfg(test)]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Applies one scan to the present set.
    ///
    /// Arrivals are detected before departures. Every action runs to
    /// completion before the next one starts, and a failing action never
    /// stops the rest of the list or the cycle.
    pub async fn transition(
        &mut self,
        scan: &[Device],
        config: &[DeviceConfig],
    ) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        for device_config in config {
            for device in scan {
                if device.address != device_config.address
                    || self.present.contains_key(&device_config.address)
                {
                    continue;
                }
                info!(
                    "{} ({}) arrived as {:?}",
                    device_config.name, device.address, device.name
                );
                self.present.insert(
                    device_config.address.clone(),
                    PresentDevice {
                        name: device.name.clone(),
                    },
                );
                self.run_actions(&device_config.name, &device_config.start)
                    .await;
                changes.push(PresenceChange::Arrived(device.clone()));
            }
        }

        // Collected up front so the map is never mutated while walked.
        let departed: Vec<String> = self
            .present
            .keys()
            .filter(|address| !scan.iter().any(|device| &device.address == *address))
            .cloned()
            .collect();

        for address in departed {
            let Some(record) = self.present.remove(&address) else {
                continue;
            };
            match config.iter().find(|c| c.address == address) {
                Some(device_config) => {
                    info!("{} ({}) departed", device_config.name, address);
                    self.run_actions(&device_config.name, &device_config.stop)
                        .await;
                    changes.push(PresenceChange::Departed(Device {
                        address,
                        name: record.name,
                    }));
                }
                None => {
                    debug!(
                        "{} ({}) is gone and no longer configured, dropping it",
                        record.name, address
                    );
                }
            }
        }

        changes
    }

    async fn run_actions(&self, device_name: &str, commands: &[String]) {
        for command in commands {
            match self.runner.run(command).await {
                ActionOutcome::Succeeded => debug!("{}: {:?} succeeded", device_name, command),
                ActionOutcome::Failed { code: Some(code) } => {
                    warn!("{}: {:?} exited with status {}", device_name, command, code)
                }
                ActionOutcome::Failed { code: None } => {
                    warn!("{}: {:?} was terminated by a signal", device_name, command)
                }
                ActionOutcome::NotExecutable => {
                    warn!("{}: unable to launch {:?}", device_name, command)
                }
                ActionOutcome::SpawnFailed(err) => {
                    warn!("{}: failed to spawn {:?}: {}", device_name, command, err)
                }
                ActionOutcome::TimedOut => {
                    warn!("{}: {:?} timed out and was killed", device_name, command)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{RecordingRunner, SlowRunner, device, device_config};

    fn engine() -> PresenceEngine<RecordingRunner> {
        PresenceEngine::new(RecordingRunner::new())
    }

    #[tokio::test]
    async fn test_arrive_then_depart_scenario() {
        let config = vec![device_config("AA:AA", &["/bin/true"], &["/bin/false"])];
        let mut engine = engine();

        let changes = engine.transition(&[device("AA:AA")], &config).await;
        assert_eq!(changes, vec![PresenceChange::Arrived(device("AA:AA"))]);
        assert!(engine.is_present("AA:AA"));
        assert_eq!(engine.runner().calls(), vec!["/bin/true"]);

        let changes = engine.transition(&[], &config).await;
        assert_eq!(changes, vec![PresenceChange::Departed(device("AA:AA"))]);
        assert!(engine.is_empty());
        assert_eq!(engine.runner().calls(), vec!["/bin/true", "/bin/false"]);

        let changes = engine.transition(&[], &config).await;
        assert!(changes.is_empty());
        assert_eq!(engine.runner().calls().len(), 2);
    }

    #[tokio::test]
    async fn test_start_actions_fire_once_while_present() {
        let config = vec![device_config("AA:AA", &["start"], &["stop"])];
        let mut engine = engine();

        for _ in 0..5 {
            engine.transition(&[device("AA:AA")], &config).await;
        }

        assert_eq!(engine.runner().count("start"), 1);
        assert_eq!(engine.runner().count("stop"), 0);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_departure_needs_a_new_arrival() {
        let config = vec![device_config("AA:AA", &["start"], &["stop"])];
        let mut engine = engine();

        engine.transition(&[device("AA:AA")], &config).await;
        engine.transition(&[], &config).await;
        engine.transition(&[], &config).await;
        assert_eq!(engine.runner().count("stop"), 1);

        engine.transition(&[device("AA:AA")], &config).await;
        engine.transition(&[], &config).await;
        assert_eq!(engine.runner().count("start"), 2);
        assert_eq!(engine.runner().count("stop"), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_devices_are_ignored() {
        let config = vec![device_config("AA:AA", &["start"], &["stop"])];
        let mut engine = engine();

        let changes = engine
            .transition(&[device("BB:BB"), device("CC:CC")], &config)
            .await;

        assert!(changes.is_empty());
        assert!(engine.is_empty());
        assert!(engine.runner().calls().is_empty());
    }

    #[tokio::test]
    async fn test_actions_run_in_order_past_failures() {
        let config = vec![device_config("AA:AA", &["A", "B", "C"], &[])];
        let mut engine = PresenceEngine::new(RecordingRunner::failing(&["A"]));

        engine.transition(&[device("AA:AA")], &config).await;

        assert_eq!(engine.runner().calls(), vec!["A", "B", "C"]);
        assert!(engine.is_present("AA:AA"));
    }

    #[tokio::test]
    async fn test_each_action_finishes_before_the_next_starts() {
        let config = vec![
            device_config("AA:AA", &["A", "B"], &["stop A"]),
            device_config("BB:BB", &["C"], &[]),
        ];
        let mut engine = PresenceEngine::new(SlowRunner::new());

        engine
            .transition(&[device("AA:AA"), device("BB:BB")], &config)
            .await;
        engine.transition(&[device("BB:BB")], &config).await;

        assert_eq!(
            engine.runner().events(),
            vec![
                "start A", "end A", "start B", "end B", "start C", "end C", "start stop A",
                "end stop A",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_scan_clears_everything() {
        let config = vec![
            device_config("AA:AA", &[], &["stop A"]),
            device_config("BB:BB", &[], &["stop B"]),
            device_config("CC:CC", &[], &["stop C"]),
        ];
        let mut engine = engine();
        engine
            .transition(&[device("AA:AA"), device("BB:BB"), device("CC:CC")], &config)
            .await;
        assert_eq!(engine.len(), 3);

        let changes = engine.transition(&[], &config).await;

        assert_eq!(changes.len(), 3);
        assert!(engine.is_empty());
        assert_eq!(engine.runner().calls(), vec!["stop A", "stop B", "stop C"]);
    }

    #[tokio::test]
    async fn test_removed_config_departs_silently() {
        let config = vec![device_config("AA:AA", &["start"], &["stop"])];
        let mut engine = engine();
        engine.transition(&[device("AA:AA")], &config).await;

        // Still in range but no longer configured: nothing happens yet.
        let changes = engine.transition(&[device("AA:AA")], &[]).await;
        assert!(changes.is_empty());
        assert!(engine.is_present("AA:AA"));

        let changes = engine.transition(&[], &[]).await;
        assert!(changes.is_empty());
        assert!(engine.is_empty());
        assert_eq!(engine.runner().calls(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_duplicate_scan_entries_arrive_once() {
        let config = vec![device_config("AA:AA", &["start"], &[])];
        let mut engine = engine();

        let first = Device::new("AA:AA", "first");
        let second = Device::new("AA:AA", "second");
        let changes = engine.transition(&[first.clone(), second], &config).await;

        assert_eq!(changes, vec![PresenceChange::Arrived(first)]);
        assert_eq!(engine.runner().count("start"), 1);
        let (_, record) = engine.present().next().unwrap();
        assert_eq!(record.name, "first");
    }

    #[tokio::test]
    async fn test_arrival_and_departure_in_one_cycle() {
        let config = vec![
            device_config("AA:AA", &["start A"], &["stop A"]),
            device_config("BB:BB", &["start B"], &["stop B"]),
        ];
        let mut engine = engine();
        engine.transition(&[device("AA:AA")], &config).await;
        engine.runner().clear();

        let changes = engine.transition(&[device("BB:BB")], &config).await;

        assert_eq!(
            changes,
            vec![
                PresenceChange::Arrived(device("BB:BB")),
                PresenceChange::Departed(device("AA:AA")),
            ]
        );
        assert_eq!(engine.runner().calls(), vec!["start B", "stop A"]);
        assert!(engine.is_present("BB:BB"));
        assert!(!engine.is_present("AA:AA"));
    }

    #[tokio::test]
    async fn test_address_match_is_case_sensitive() {
        let config = vec![device_config("aa:aa", &["start"], &[])];
        let mut engine = engine();

        engine.transition(&[device("AA:AA")], &config).await;

        assert!(engine.is_empty());
        assert!(engine.runner().calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_action_lists_still_track_presence() {
        let config = vec![device_config("AA:AA", &[], &[])];
        let mut engine = engine();

        let changes = engine.transition(&[device("AA:AA")], &config).await;
        assert_eq!(changes.len(), 1);
        assert!(engine.is_present("AA:AA"));

        let changes = engine.transition(&[], &config).await;
        assert_eq!(changes.len(), 1);
        assert!(engine.runner().calls().is_empty());
    }
}
