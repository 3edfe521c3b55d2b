use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "date", with = "rfc3339_seconds")]
    pub timestamp: DateTime<Local>,
    pub co2: u16,
    pub temperature: f32,
    pub humidity: u16,
    pub pressure: f32,
}

// Fixed timestamp form for the `date` column: whole seconds, numeric offset.
// Reserializing a reading must reproduce the stored row byte for byte.
mod rfc3339_seconds {
    use chrono::{DateTime, Local, SecondsFormat};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Secs, false))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|timestamp| timestamp.with_timezone(&Local))
            .map_err(serde::de::Error::custom)
    }
}
