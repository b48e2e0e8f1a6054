use crate::ids::ConnectionId;

/// Broker key namespace for one application. Every key is prefixed with
/// `blorp:{name}:` so several applications can share a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(app_name: &str) -> Self {
        Self {
            prefix: format!("blorp:{app_name}:"),
        }
    }

    /// `sessions:{id}` — JSON string under a TTL.
    pub fn session(&self, id: &ConnectionId) -> String {
        format!("{}sessions:{}", self.prefix, id)
    }

    /// `messages:{id}` — the connection's private inbound list.
    pub fn messages(&self, id: &ConnectionId) -> String {
        format!("{}messages:{}", self.prefix, id)
    }

    /// `out` — outgoing messages read by the gateway.
    pub fn out(&self) -> String {
        format!("{}out", self.prefix)
    }

    /// `control` — shared control queue consumed by every instance.
    pub fn control(&self) -> String {
        format!("{}control", self.prefix)
    }

    /// `instances` — membership set of running instance IDs.
    pub fn instances(&self) -> String {
        format!("{}instances", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_application_prefix() {
        let keys = KeySpace::new("basic");
        let id = ConnectionId::from("c1");
        assert_eq!(keys.session(&id), "blorp:basic:sessions:c1");
        assert_eq!(keys.messages(&id), "blorp:basic:messages:c1");
        assert_eq!(keys.out(), "blorp:basic:out");
        assert_eq!(keys.control(), "blorp:basic:control");
        assert_eq!(keys.instances(), "blorp:basic:instances");
    }

    #[test]
    fn applications_do_not_collide() {
        let a = KeySpace::new("a");
        let b = KeySpace::new("b");
        assert_ne!(a.control(), b.control());
    }
}
