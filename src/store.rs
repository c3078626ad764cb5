//! File-backed persistence for ticket tokens.
//!
//! Maps an issue number to the bearer token minted when the ticket was
//! created; status queries must present the matching token. This is the only
//! state the gateway keeps on disk; the anti-abuse engine itself never
//! persists anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use constant_time_eq::constant_time_eq;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

const STORE_FILE: &str = "ticket_tokens.json";
const TOKEN_BYTES: usize = 24;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TicketFile {
    #[serde(default)]
    records: HashMap<String, String>,
}

/// Persistent issue-number -> ticket-token map.
pub struct TicketStore {
    file: PathBuf,
    records: Mutex<HashMap<String, String>>,
}

impl TicketStore {
    /// Open the store under `data_dir`, creating the directory and loading
    /// any existing token file.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let file = data_dir.join(STORE_FILE);
        let records = match std::fs::read_to_string(&file) {
            Ok(contents) => {
                let parsed: TicketFile = serde_json::from_str(&contents)
                    .map_err(|e| GatewayError::Store(format!("token file is corrupt: {e}")))?;
                parsed.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            file,
            records: Mutex::new(records),
        })
    }

    /// Record `token` for `issue_number` and persist the full map.
    pub fn set(&self, issue_number: u64, token: &str) -> Result<()> {
        let mut records = self.records.lock();
        records.insert(issue_number.to_string(), token.to_string());
        self.save(&records)
    }

    /// Check `token` against the stored token for `issue_number`.
    pub fn validate(&self, issue_number: u64, token: &str) -> bool {
        let records = self.records.lock();
        match records.get(&issue_number.to_string()) {
            Some(saved) => constant_time_eq(saved.as_bytes(), token.as_bytes()),
            None => false,
        }
    }

    fn save(&self, records: &HashMap<String, String>) -> Result<()> {
        let payload = serde_json::to_string_pretty(&TicketFile {
            records: records.clone(),
        })
        .map_err(|e| GatewayError::Store(format!("encoding token file failed: {e}")))?;

        std::fs::write(&self.file, payload)?;
        Ok(())
    }
}

/// Mint a fresh URL-safe ticket token.
pub fn new_ticket_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
