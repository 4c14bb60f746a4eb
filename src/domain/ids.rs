use rand::RngCore;

/// Generates sortable, globally-unique request/intent identifiers:
/// `<prefix>-<hexMillis>-<20hexRandom>`. No coordination with any store
/// is required; collisions are cryptographically improbable.
pub struct IdGenerator {
    prefix: String,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn generate(&self) -> String {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut entropy = [0u8; 10];
        rand::rng().fill_bytes(&mut entropy);
        format!(
            "{}-{:016x}-{}",
            self.prefix,
            millis,
            hex_encode(&entropy)
        )
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new("rid")
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_sortable_and_unique() {
        let id_gen = IdGenerator::default();
        let a = id_gen.generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = id_gen.generate();
        assert_ne!(a, b);
        assert!(a.starts_with("rid-"));
        // Same-millisecond collisions are improbable; lexicographic comparison
        // should match timestamp ordering for ids minted far enough apart.
        assert!(a < b);
    }

    #[test]
    fn test_custom_prefix() {
        let id_gen = IdGenerator::new("cancel");
        assert!(id_gen.generate().starts_with("cancel-"));
    }
}
