use serde::{Deserialize, Serialize};

/// The decoded view of a change stream event: just enough to compose the
/// message subject and to checkpoint the stream position. The full event is
/// forwarded to the bus as-is; this envelope never stands in for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "_id")]
    pub id: ChangeEventId,
    #[serde(rename = "operationType")]
    pub operation_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEventId {
    #[serde(rename = "_data", default)]
    pub data: String,
}

impl ChangeEvent {
    /// The stream position to resume after, if any. An empty token is the
    /// sentinel for "no prior position" and must never be used to resume.
    pub fn resume_point(&self) -> Option<&str> {
        if self.id.data.is_empty() {
            None
        } else {
            Some(&self.id.data)
        }
    }
}
