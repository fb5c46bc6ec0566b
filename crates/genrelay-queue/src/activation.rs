use genrelay_core::JobDescriptor;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    /// Admission, provider call and result branching.
    Generate,
    /// One poll of a remote task.
    Poll,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Poll => "poll",
        }
    }
}

impl std::fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of queued work, serialized as JSON in the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub id: Ulid,
    pub kind: ActivationKind,
    pub descriptor: JobDescriptor,
    /// Delivery attempts that ended in `retry`; starts at 0.
    #[serde(default)]
    pub attempt: u32,
}

impl Activation {
    pub fn new(kind: ActivationKind, descriptor: JobDescriptor) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            descriptor,
            attempt: 0,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ActivationKind::Poll).unwrap();
        assert_eq!(json, "\"poll\"");
    }

    #[test]
    fn test_attempt_defaults_to_zero() {
        let payload = format!(
            r#"{{"id":"{}","kind":"generate","descriptor":{{"model_key":"runway","user_id":7}}}}"#,
            Ulid::new()
        );
        let activation = Activation::from_json(&payload).unwrap();
        assert_eq!(activation.attempt, 0);
        assert_eq!(activation.kind, ActivationKind::Generate);
        assert_eq!(activation.descriptor.model_key, "runway");
    }
}
