use super::SiteIdentifier;

/// Telemetry published by the GX device, `N/{site}/system/0/{path}`
pub fn telemetry(site: &SiteIdentifier, path: &str) -> String {
    return format!("N/{}/system/0/{}", site, path.trim_start_matches('/'));
}

/// Write requests towards the GX device, `W/{site}/system/0/{path}`
pub fn command(site: &SiteIdentifier, path: &str) -> String {
    return format!("W/{}/system/0/{}", site, path.trim_start_matches('/'));
}

pub fn keepalive(site: &SiteIdentifier) -> String {
    return format!("R/{}/keepalive", site);
}

pub fn serial_request(site: &SiteIdentifier) -> String {
    return format!("R/{}/system/0/Serial", site);
}

/// The GX device answers a publish on the R/ twin of a topic with the
/// current value on the N/ topic.
pub fn read_request(topic: &str) -> String {
    if topic.starts_with("N/") {
        return topic.replacen("N/", "R/", 1);
    }
    return topic.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_namespace() {
        let site = SiteIdentifier::new("abc123");
        assert_eq!(telemetry(&site, "Batteries"), "N/abc123/system/0/Batteries");
        assert_eq!(telemetry(&site, "/Dc/Pv/Power"), "N/abc123/system/0/Dc/Pv/Power");
        assert_eq!(command(&site, "Relay/1/State"), "W/abc123/system/0/Relay/1/State");
        assert_eq!(keepalive(&site), "R/abc123/keepalive");
        assert_eq!(serial_request(&site), "R/abc123/system/0/Serial");
    }

    #[test]
    fn test_read_request() {
        assert_eq!(read_request("N/abc/system/0/Dc/Battery/Voltage"), "R/abc/system/0/Dc/Battery/Voltage");
        /* Only the prefix is rewritten */
        assert_eq!(read_request("N/N/system/0/Serial"), "R/N/system/0/Serial");
        assert_eq!(read_request("W/abc/system/0/Relay/0/State"), "W/abc/system/0/Relay/0/State");
    }
}
