use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// A discovered peripheral, reduced to what scanning and connecting need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralHandle {
    id: String,
    name: Option<String>,
    rssi: Option<i16>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidHandle {
    #[error("peripheral identifier is empty")]
    EmptyId,
}

impl PeripheralHandle {
    pub fn new(
        id: impl Into<String>,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> Result<Self, InvalidHandle> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InvalidHandle::EmptyId);
        }
        let name = name.filter(|n| !n.is_empty());
        Ok(Self { id, name, rssi })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Last seen signal strength in dBm.
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    fn refresh(&mut self, name: Option<String>, rssi: Option<i16>) {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.name = Some(name);
        }
        if rssi.is_some() {
            self.rssi = rssi;
        }
    }
}

impl Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

// Identity is the platform identifier only; name and rssi change between sightings
impl Hash for PeripheralHandle {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.id.hash(state);
    }
}

impl PartialEq for PeripheralHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id.eq(&other.id)
    }
}

impl Eq for PeripheralHandle {}

/// Accepts advertisements whose name carries the product marker.
#[derive(Debug, Clone)]
pub struct PeripheralFilter {
    marker: String,
}

impl PeripheralFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn accepts(&self, advertised_name: Option<&str>) -> bool {
        match advertised_name {
            Some(name) => name.contains(self.marker.as_str()),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Refreshed,
    Ignored,
}

/// Candidates of one scan session, in order of first sighting.
#[derive(Debug, Default, Clone)]
pub struct CandidateSet {
    entries: Vec<PeripheralHandle>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record one advertisement.
    ///
    /// A known identifier is refreshed in place whatever its name; an unknown
    /// one is only added when the filter accepts its name.
    pub fn observe(
        &mut self,
        filter: &PeripheralFilter,
        id: &str,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> Result<Sighting, InvalidHandle> {
        if let Some(known) = self.entries.iter_mut().find(|p| p.id == id) {
            known.refresh(name, rssi);
            return Ok(Sighting::Refreshed);
        }
        if !filter.accepts(name.as_deref()) {
            return Ok(Sighting::Ignored);
        }
        self.entries.push(PeripheralHandle::new(id, name, rssi)?);
        Ok(Sighting::New)
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralHandle> {
        self.entries.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<PeripheralHandle> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PeripheralFilter {
        PeripheralFilter::new("ESP32")
    }

    #[test]
    fn filter_matches_marker_substring() {
        let f = filter();
        assert!(f.accepts(Some("ESP32-Mock-Streamer")));
        assert!(f.accepts(Some("ESP32_STEP1")));
        assert!(!f.accepts(Some("RandomSpeaker")));
        assert!(!f.accepts(Some("esp32-lowercase")));
        assert!(!f.accepts(None));
    }

    #[test]
    fn handle_requires_identifier() {
        assert_eq!(
            PeripheralHandle::new("  ", None, None),
            Err(InvalidHandle::EmptyId)
        );
        let handle = PeripheralHandle::new("AA:BB", Some(String::new()), Some(-60)).unwrap();
        assert_eq!(handle.name(), None);
        assert_eq!(handle.to_string(), "AA:BB");
    }

    #[test]
    fn repeated_sightings_refresh_in_place() {
        let f = filter();
        let mut set = CandidateSet::new();
        assert_eq!(
            set.observe(&f, "a", Some("ESP32-A".into()), Some(-80)),
            Ok(Sighting::New)
        );
        assert_eq!(
            set.observe(&f, "b", Some("ESP32-B".into()), Some(-40)),
            Ok(Sighting::New)
        );
        assert_eq!(set.observe(&f, "a", None, Some(-30)), Ok(Sighting::Refreshed));

        let list = set.to_vec();
        assert_eq!(list.len(), 2);
        // Insertion order, not signal order
        assert_eq!(list[0].id(), "a");
        assert_eq!(list[0].rssi(), Some(-30));
        assert_eq!(list[0].name(), Some("ESP32-A"));
        assert_eq!(list[1].id(), "b");
    }

    #[test]
    fn rejected_and_unnamed_sightings_are_ignored() {
        let f = filter();
        let mut set = CandidateSet::new();
        assert_eq!(
            set.observe(&f, "x", Some("RandomSpeaker".into()), None),
            Ok(Sighting::Ignored)
        );
        assert_eq!(set.observe(&f, "y", None, Some(-50)), Ok(Sighting::Ignored));
        assert!(set.is_empty());
    }

    #[test]
    fn clear_discards_previous_session() {
        let f = filter();
        let mut set = CandidateSet::new();
        set.observe(&f, "a", Some("ESP32".into()), None).unwrap();
        set.clear();
        assert!(set.get("a").is_none());
    }
}
