use serde::{Deserialize, Serialize};

use crate::crypt::Cipher;
use crate::error::CryptError;
use crate::job::JobRecord;

/// How the payload of an envelope is carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    #[default]
    Clear,
    Aes,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvMode::Clear => write!(f, "clear"),
            EnvMode::Aes => write!(f, "aes"),
        }
    }
}

impl std::str::FromStr for EnvMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear" => Ok(EnvMode::Clear),
            "aes" => Ok(EnvMode::Aes),
            other => Err(format!("unknown envelope mode '{}'", other)),
        }
    }
}

/// Queue-level wrapper around a job record.
///
/// Serializes as `{"env": "clear", "payload": {..}}` or
/// `{"env": "aes", "payload": "<base64>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "env", content = "payload", rename_all = "lowercase")]
pub enum Envelope {
    Clear(JobRecord),
    Aes(String),
}

impl Envelope {
    pub fn mode(&self) -> EnvMode {
        match self {
            Envelope::Clear(_) => EnvMode::Clear,
            Envelope::Aes(_) => EnvMode::Aes,
        }
    }

    /// Wrap `record` for the queue, sealing it when `mode` is `Aes`.
    pub fn seal(
        record: &JobRecord,
        mode: EnvMode,
        cipher: Option<&Cipher>,
    ) -> Result<Self, CryptError> {
        match mode {
            EnvMode::Clear => Ok(Envelope::Clear(record.clone())),
            EnvMode::Aes => {
                let cipher = cipher.ok_or(CryptError::EmptyKey)?;
                Ok(Envelope::Aes(cipher.seal(record)?))
            }
        }
    }

    /// Recover the record carried by this envelope.
    pub fn open(self, cipher: Option<&Cipher>) -> Result<JobRecord, CryptError> {
        match self {
            Envelope::Clear(record) => Ok(record),
            Envelope::Aes(ciphertext) => cipher.ok_or(CryptError::EmptyKey)?.open(&ciphertext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobTemplate;
    use serde_json::{json, Map};

    #[test]
    fn clear_envelope_wire_shape() {
        let job = JobTemplate::new("j1", "sys.ping", vec![json!("a")], Map::new()).for_node("n1");
        let env = Envelope::seal(&job.record, EnvMode::Clear, None).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["env"], "clear");
        assert_eq!(value["payload"]["jid"], "j1");
        assert_eq!(value["payload"]["args"], json!(["a"]));
    }

    #[test]
    fn aes_envelope_carries_a_string() {
        let cipher = Cipher::new("token").unwrap();
        let job = JobTemplate::new("j1", "sys.ping", vec![], Map::new()).for_node("n1");
        let env = Envelope::seal(&job.record, EnvMode::Aes, Some(&cipher)).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["env"], "aes");
        assert!(value["payload"].is_string());
        assert_eq!(env.open(Some(&cipher)).unwrap(), job.record);
    }

    #[test]
    fn aes_without_cipher_fails() {
        let job = JobTemplate::new("j1", "sys.ping", vec![], Map::new()).for_node("n1");
        assert!(matches!(
            Envelope::seal(&job.record, EnvMode::Aes, None),
            Err(CryptError::EmptyKey)
        ));
    }

    #[test]
    fn env_mode_parses() {
        assert_eq!("aes".parse::<EnvMode>().unwrap(), EnvMode::Aes);
        assert_eq!("clear".parse::<EnvMode>().unwrap(), EnvMode::Clear);
        assert!("rot13".parse::<EnvMode>().is_err());
    }
}
