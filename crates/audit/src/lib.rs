/// External collaborator: the CEF-style audit sink both the channel service
/// and the IP filter fan events out to. A production deployment wires this
/// to syslog or a SIEM; this crate only specifies the interface (mirroring
/// how the rest of the stack treats the shared cache and the admin page
/// renderer) and ships a logging implementation for local use.
///
/// Every method has a no-op default so a sink only needs to override the
/// events it cares about.
pub trait AuditSink: Send + Sync {
    /// A channel was destroyed after receiving a malformed client id.
    fn bad_client_id(&self, _channel_id: &str) {}

    /// A channel was destroyed after a third, unrecognized client id
    /// touched it.
    fn third_party_intrusion(&self, _channel_id: &str) {}

    /// A best-effort channel deletion (admission failure, report, GET cap)
    /// did not succeed.
    fn channel_deletion_failed(&self, _channel_id: &str) {}

    /// An ip crossed a threshold and was added to the blacklist.
    fn blacklisted(&self, _ip: &str) {}

    /// A bad-request counter fired for an ip, independent of whether it
    /// went on to cross the blacklist threshold.
    fn bad_request(&self, _ip: &str) {}

    /// `POST /report` carried a non-empty log header or body.
    fn report(&self, _message: &str) {}
}

/// Logs every event at info level in a flat `key=value` shape, the way a
/// syslog-backed CEF sink would before formatting it into the CEF wire
/// format proper.
#[derive(Clone, Copy, Default)]
pub struct LoggingAuditSink;

impl AuditSink for LoggingAuditSink {
    fn bad_client_id(&self, channel_id: &str) {
        log::info!("audit: bad_client_id channel={channel_id}");
    }

    fn third_party_intrusion(&self, channel_id: &str) {
        log::warn!("audit: third_party_intrusion channel={channel_id}");
    }

    fn channel_deletion_failed(&self, channel_id: &str) {
        log::error!("audit: channel_deletion_failed channel={channel_id}");
    }

    fn blacklisted(&self, ip: &str) {
        log::warn!("audit: blacklisted ip={ip}");
    }

    fn bad_request(&self, ip: &str) {
        log::info!("audit: bad_request ip={ip}");
    }

    fn report(&self, message: &str) {
        log::info!("audit: report message={message:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;
    impl AuditSink for Silent {}

    #[test]
    fn default_methods_are_callable_no_ops() {
        let sink = Silent;
        sink.bad_client_id("cid");
        sink.third_party_intrusion("cid");
        sink.channel_deletion_failed("cid");
        sink.blacklisted("1.2.3.4");
        sink.bad_request("1.2.3.4");
        sink.report("hello");
    }
}
