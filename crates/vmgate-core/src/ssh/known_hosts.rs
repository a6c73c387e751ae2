use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// A server key pulled out of an OpenSSH `known_hosts` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostKey {
    /// Key algorithm, e.g. `ssh-ed25519`.
    pub algorithm: String,
    /// Base64 key blob exactly as stored.
    pub key_base64: String,
}

/// Default location: `~/.ssh/known_hosts`.
pub fn default_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(Path::new(&home).join(".ssh").join("known_hosts"))
}

/// Find the first key for `host` in a `known_hosts` file.
///
/// `host` uses the OpenSSH convention: bare hostname for port 22,
/// `[host]:port` otherwise. Both plain and `|1|`-hashed entries match;
/// unparsable lines are skipped.
pub fn lookup(path: &Path, host: &str) -> Option<KnownHostKey> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(algorithm), Some(key)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if hosts_match(hosts, host) {
            return Some(KnownHostKey {
                algorithm: algorithm.to_string(),
                key_base64: key.to_string(),
            });
        }
    }
    None
}

fn hosts_match(field: &str, host: &str) -> bool {
    if let Some(hashed) = field.strip_prefix("|1|") {
        return hashed_match(hashed, host);
    }
    field.split(',').any(|h| h == host)
}

/// `|1|base64(salt)|base64(HMAC-SHA1(salt, host))`, the `ssh-keyscan -H`
/// form.
fn hashed_match(entry: &str, host: &str) -> bool {
    let Some((salt_b64, hash_b64)) = entry.split_once('|') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (BASE64.decode(salt_b64), BASE64.decode(hash_b64)) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    mac.update(host.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

/// Hash a hostname the way `ssh-keyscan -H` does. Test helper, also handy
/// for diagnostics.
pub fn hash_hostname(salt: &[u8], host: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(salt).expect("hmac accepts any salt length");
    mac.update(host.as_bytes());
    format!(
        "|1|{}|{}",
        BASE64.encode(salt),
        BASE64.encode(mac.finalize().into_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIFo5aXN0ZXN0a2V5dGVzdGtleXRlc3RrZXl0ZXN0a2V5";

    fn write_known_hosts(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_plain_host_match() {
        let file = write_known_hosts(&[
            "# comment".to_string(),
            format!("192.168.127.2,gateway.containers.internal ssh-ed25519 {KEY}"),
        ]);
        let found = lookup(file.path(), "192.168.127.2").unwrap();
        assert_eq!(found.algorithm, "ssh-ed25519");
        assert_eq!(found.key_base64, KEY);
        assert!(lookup(file.path(), "192.168.127.3").is_none());
    }

    #[test]
    fn test_bracketed_port_form() {
        let file = write_known_hosts(&[format!("[192.168.127.2]:2222 ssh-rsa {KEY}")]);
        assert!(lookup(file.path(), "[192.168.127.2]:2222").is_some());
        assert!(lookup(file.path(), "192.168.127.2").is_none());
    }

    #[test]
    fn test_hashed_host_match() {
        let hashed = hash_hostname(b"0123456789abcdef0123", "192.168.127.2");
        let file = write_known_hosts(&[format!("{hashed} ssh-ed25519 {KEY}")]);
        assert!(lookup(file.path(), "192.168.127.2").is_some());
        assert!(lookup(file.path(), "192.168.127.9").is_none());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let file = write_known_hosts(&[
            "gibberish".to_string(),
            "|1|notbase64 ssh-rsa key".to_string(),
            format!("192.168.127.2 ssh-ed25519 {KEY}"),
        ]);
        assert!(lookup(file.path(), "192.168.127.2").is_some());
    }
}
