//! Process-global key material for session resumption across restarts.
//!
//! Two 32-byte secrets, the TLS session-ticket key and the QUIC
//! stateless-reset key, are loaded from the key directory or generated on
//! first run, written with mode 0600, and never rotated while the process
//! lives.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::RngCore;
use tracing::info;

use conduit_dns_domain::DnsError;

pub const KEY_LEN: usize = 32;

const TICKET_KEY_FILE: &str = "session_ticket.key";
const RESET_KEY_FILE: &str = "stateless_reset.key";

static KEYS: OnceLock<ProcessKeys> = OnceLock::new();

#[derive(Clone)]
pub struct ProcessKeys {
    pub session_ticket: [u8; KEY_LEN],
    pub stateless_reset: [u8; KEY_LEN],
}

/// Loads (or creates) the process keys. The first caller fixes the key
/// directory; later calls return the same material regardless of argument.
pub fn process_keys(dir: &str) -> Result<ProcessKeys, DnsError> {
    if let Some(keys) = KEYS.get() {
        return Ok(keys.clone());
    }

    let dir = PathBuf::from(dir);
    fs::create_dir_all(&dir)
        .map_err(|e| DnsError::Io(format!("create key dir {}: {}", dir.display(), e)))?;

    let keys = ProcessKeys {
        session_ticket: load_or_generate(&dir.join(TICKET_KEY_FILE))?,
        stateless_reset: load_or_generate(&dir.join(RESET_KEY_FILE))?,
    };

    Ok(KEYS.get_or_init(|| keys).clone())
}

fn load_or_generate(path: &Path) -> Result<[u8; KEY_LEN], DnsError> {
    match fs::read(path) {
        Ok(data) if data.len() == KEY_LEN => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&data);
            return Ok(key);
        }
        Ok(_) => {
            info!(path = %path.display(), "key file has wrong length, regenerating");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(DnsError::Io(format!("read {}: {}", path.display(), e)));
        }
    }

    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| DnsError::Io(format!("create {}: {}", path.display(), e)))?;
    file.write_all(&key)
        .map_err(|e| DnsError::Io(format!("write {}: {}", path.display(), e)))?;

    info!(path = %path.display(), "generated new key file");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_stable() {
        let dir = std::env::temp_dir().join(format!("conduit-keys-{}", std::process::id()));
        let path = dir.join("test.key");
        fs::create_dir_all(&dir).unwrap();

        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first, second);

        fs::remove_dir_all(&dir).ok();
    }
}
