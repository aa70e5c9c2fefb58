use serde::{Deserialize, Serialize};

/// Lowest refresh interval the dashboard accepts, in seconds.
pub const MIN_REFRESH_INTERVAL_SECONDS: u32 = 60;

/// Lowest number of departures shown per stop.
pub const MIN_DEPARTURES_SHOWN: u32 = 1;

/// Transit network a stop belongs to.
///
/// Each network is served by its own departure fetcher; the wire values are
/// the short codes the exported document uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum City {
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B")]
    B,
}

impl City {
    /// Parse the wire code of a network.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

/// One monitored stop on the dashboard.
///
/// `id` is unique within an [`AppConfig`]. `position` is the display slot;
/// after any normalizing pass positions are contiguous and zero-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopConfig {
    pub id: String,
    pub name: String,
    pub city: City,
    #[serde(default)]
    pub stop_id: String,
    #[serde(default)]
    pub walking_time_minutes: u32,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub position: usize,
}

fn default_visible() -> bool {
    true
}

impl StopConfig {
    /// Compare every field except `position`.
    ///
    /// Position belongs to the slot, not to the stop's content, so two stops
    /// that differ only in position carry the same content.
    pub fn same_content(&self, other: &StopConfig) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.city == other.city
            && self.stop_id == other.stop_id
            && self.walking_time_minutes == other.walking_time_minutes
            && self.visible == other.visible
    }

    /// Overwrite the content fields with `incoming`, keeping this stop's slot.
    pub fn update_content_from(&mut self, incoming: &StopConfig) {
        let position = self.position;
        *self = incoming.clone();
        self.position = position;
    }
}

/// The user's complete dashboard configuration.
///
/// Owned by the [`ConfigRepository`](crate::config::ConfigRepository); the
/// engine only ever works on transient copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub stops: Vec<StopConfig>,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u32,
    #[serde(default = "default_max_departures")]
    pub max_departures_shown: u32,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_refresh_interval() -> u32 {
    60
}

fn default_max_departures() -> u32 {
    10
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stops: Vec::new(),
            dark_mode: false,
            refresh_interval_seconds: default_refresh_interval(),
            max_departures_shown: default_max_departures(),
            language: default_language(),
        }
    }
}

impl AppConfig {
    /// Find a stop by its identifier.
    pub fn stop(&self, id: &str) -> Option<&StopConfig> {
        self.stops.iter().find(|s| s.id == id)
    }

    /// Copy the four global settings from `source`, leaving stops untouched.
    pub fn take_global_settings(&mut self, source: &AppConfig) {
        self.dark_mode = source.dark_mode;
        self.refresh_interval_seconds = source.refresh_interval_seconds;
        self.max_departures_shown = source.max_departures_shown;
        self.language = source.language.clone();
    }

    /// Number of global settings that differ from `other` (0..=4).
    pub fn settings_diff_count(&self, other: &AppConfig) -> usize {
        [
            self.dark_mode != other.dark_mode,
            self.refresh_interval_seconds != other.refresh_interval_seconds,
            self.max_departures_shown != other.max_departures_shown,
            self.language != other.language,
        ]
        .iter()
        .filter(|changed| **changed)
        .count()
    }

    /// Check that the global settings respect their lower bounds.
    pub fn settings_in_range(&self) -> bool {
        self.refresh_interval_seconds >= MIN_REFRESH_INTERVAL_SECONDS
            && self.max_departures_shown >= MIN_DEPARTURES_SHOWN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: &str, position: usize) -> StopConfig {
        StopConfig {
            id: id.to_string(),
            name: format!("Stop {id}"),
            city: City::A,
            stop_id: format!("sid-{id}"),
            walking_time_minutes: 4,
            visible: true,
            position,
        }
    }

    #[test]
    fn test_app_config_defaults() {
        let config = AppConfig::default();
        assert!(config.stops.is_empty());
        assert_eq!(config.refresh_interval_seconds, 60);
        assert_eq!(config.max_departures_shown, 10);
        assert_eq!(config.language, "en");
        assert!(config.settings_in_range());
    }

    #[test]
    fn test_same_content_ignores_position() {
        let a = stop("s1", 0);
        let b = stop("s1", 7);
        assert!(a.same_content(&b));

        let mut c = stop("s1", 0);
        c.walking_time_minutes = 9;
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_update_content_keeps_slot() {
        let mut existing = stop("s1", 3);
        let mut incoming = stop("s1", 0);
        incoming.name = "Renamed".to_string();
        incoming.visible = false;

        existing.update_content_from(&incoming);

        assert_eq!(existing.position, 3);
        assert_eq!(existing.name, "Renamed");
        assert!(!existing.visible);
    }

    #[test]
    fn test_settings_diff_count() {
        let base = AppConfig::default();
        let mut other = AppConfig::default();
        assert_eq!(base.settings_diff_count(&other), 0);

        other.dark_mode = true;
        other.language = "de".to_string();
        assert_eq!(base.settings_diff_count(&other), 2);
    }

    #[test]
    fn test_stop_deserializes_with_defaults() {
        let json = r#"{"id":"s1","name":"Main St","city":"B"}"#;
        let parsed: StopConfig = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.city, City::B);
        assert!(parsed.visible);
        assert_eq!(parsed.position, 0);
        assert_eq!(parsed.stop_id, "");
    }

    #[test]
    fn test_city_codes() {
        assert_eq!(City::from_code("A"), Some(City::A));
        assert_eq!(City::from_code("C"), None);
        assert_eq!(City::B.code(), "B");
    }
}
