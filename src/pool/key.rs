use std::{fmt, num::NonZeroUsize, sync::Arc};

/// Identifies the database belonging to one tenant.
///
/// Keys are cheap to clone and compare. The pool never interprets a key beyond
/// equality; it is handed to the connection factory verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey(Arc<str>);

impl TenantKey {
    /// Create a key from a tenant name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        TenantKey(name.into())
    }

    /// The tenant name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a tenant key from a request host.
    ///
    /// The host may carry a port. Returns the label immediately to the left of
    /// `base_domain`, so `acme.lvh.me:3000` under `lvh.me` is `acme`. Returns `None` for
    /// the bare base domain, for hosts outside of it, and for labels which are not
    /// lowercase alphanumerics and dashes.
    pub fn from_host(host: &str, base_domain: &str) -> Option<Self> {
        let host = match host.rsplit_once(':') {
            Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                name
            }
            _ => host,
        };

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let base = base_domain
            .trim_start_matches('.')
            .trim_end_matches('.')
            .to_ascii_lowercase();

        let prefix = host.strip_suffix(&base)?.strip_suffix('.')?;
        let label = prefix.rsplit('.').next()?;

        let valid = !label.is_empty()
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

        valid.then(|| TenantKey::new(label))
    }
}

impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TenantKey").field(&&*self.0).finish()
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantKey {
    fn from(value: &str) -> Self {
        TenantKey::new(value)
    }
}

impl From<String> for TenantKey {
    fn from(value: String) -> Self {
        TenantKey::new(value)
    }
}

impl AsRef<str> for TenantKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies one installation of a tenant's connection in the index.
///
/// A tenant that is evicted and re-created gets a new generation, so that late
/// releases and late failure reports for the old connection are ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Generation(NonZeroUsize);

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({})", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Generations {
    counter: NonZeroUsize,
}

impl Default for Generations {
    fn default() -> Self {
        Self {
            counter: NonZeroUsize::MIN,
        }
    }
}

impl Generations {
    pub(crate) fn next(&mut self) -> Generation {
        let generation = Generation(self.counter);
        self.counter = self.counter.checked_add(1).unwrap_or(NonZeroUsize::MIN);
        generation
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn generation_wrap() {
        let mut generations = Generations {
            counter: NonZeroUsize::new(usize::MAX).unwrap(),
        };

        let last = generations.next();
        assert_eq!(last.0, NonZeroUsize::new(usize::MAX).unwrap());

        let first = generations.next();
        assert_eq!(first.0, NonZeroUsize::MIN);
        assert_ne!(first, last);
        assert_eq!(format!("{first:?}"), "Generation(1)");
    }

    #[test]
    fn generations_are_distinct() {
        let mut generations = Generations::default();
        let a = generations.next();
        let b = generations.next();
        assert_ne!(a, b);
    }

    #[test]
    fn key_formatting() {
        let key = TenantKey::from("acme");
        assert_eq!(key.to_string(), "acme");
        assert_eq!(format!("{key:?}"), "TenantKey(\"acme\")");
        assert_eq!(key, TenantKey::new(String::from("acme")));
    }

    #[test]
    fn from_host_subdomain() {
        assert_eq!(
            TenantKey::from_host("acme.lvh.me:3000", "lvh.me"),
            Some(TenantKey::from("acme"))
        );
        assert_eq!(
            TenantKey::from_host("Acme.LVH.me", "lvh.me"),
            Some(TenantKey::from("acme"))
        );
        assert_eq!(
            TenantKey::from_host("api.acme.lvh.me.", ".lvh.me"),
            Some(TenantKey::from("acme"))
        );
    }

    #[test]
    fn from_host_rejects() {
        assert_eq!(TenantKey::from_host("lvh.me:3000", "lvh.me"), None);
        assert_eq!(TenantKey::from_host("acme.example.com", "lvh.me"), None);
        assert_eq!(TenantKey::from_host("acmelvh.me", "lvh.me"), None);
        assert_eq!(TenantKey::from_host("ac_me.lvh.me", "lvh.me"), None);
    }
}
