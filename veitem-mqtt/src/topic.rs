//! Topic scheme
//!
//! | Topic                        | Direction        | Meaning                      |
//! |------------------------------|------------------|------------------------------|
//! | `N/<portal>/<path>`          | device → us      | value notification           |
//! | `W/<portal>/<path>`          | us → device      | write                        |
//! | `R/<portal>/<path>`          | us → device      | read request                 |
//! | `R/<portal>/keepalive`       | us → device      | keep notifications flowing   |
//! | `N/<portal>/heartbeat`       | device → us      | device liveness              |
//! | `N/<portal>/full_publish_completed` | device → us | initial republish finished |
//! | `N/+/system/0/Serial`        | device → us      | discovery of the portal id   |

pub const DISCOVERY: &str = "N/+/system/0/Serial";
pub const KEEPALIVE: &str = "keepalive";
pub const HEARTBEAT: &str = "heartbeat";
pub const FULL_PUBLISH_COMPLETED: &str = "full_publish_completed";

pub fn notification(portal_id: &str, path: &str) -> String {
    format!("N/{}/{}", portal_id, path)
}

/// Subscription covering every notification of a portal
pub fn notifications(portal_id: &str) -> String {
    notification(portal_id, "#")
}

pub fn write(portal_id: &str, path: &str) -> String {
    format!("W/{}/{}", portal_id, path)
}

pub fn read(portal_id: &str, path: &str) -> String {
    format!("R/{}/{}", portal_id, path)
}

pub fn keepalive(portal_id: &str) -> String {
    read(portal_id, KEEPALIVE)
}

/// Portal id announced on `N/<portal>/system/0/Serial`
pub fn serial_portal(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["N", portal, "system", "0", "Serial"] if !portal.is_empty() => Some(*portal),
        _ => None,
    }
}

/// Item path of a notification topic of `portal_id`
pub fn notification_path<'a>(topic: &'a str, portal_id: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix("N/")?.strip_prefix(portal_id)?.strip_prefix('/')?;
    (!rest.is_empty()).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_topics() {
        assert_eq!(notifications("c0619ab1"), "N/c0619ab1/#");
        assert_eq!(write("c0619ab1", "battery/512/Soc"), "W/c0619ab1/battery/512/Soc");
        assert_eq!(read("c0619ab1", "battery/512/Soc"), "R/c0619ab1/battery/512/Soc");
        assert_eq!(keepalive("c0619ab1"), "R/c0619ab1/keepalive");
    }

    #[rstest]
    #[case("N/c0619ab1/system/0/Serial", Some("c0619ab1"))]
    #[case("N//system/0/Serial", None)]
    #[case("N/c0619ab1/system/0/Serial/extra", None)]
    #[case("W/c0619ab1/system/0/Serial", None)]
    #[case("N/c0619ab1/battery/0/Serial", None)]
    fn test_serial_portal(#[case] topic: &str, #[case] expected: Option<&str>) {
        assert_eq!(serial_portal(topic), expected);
    }

    #[rstest]
    #[case("N/1234/Battery/Soc", Some("Battery/Soc"))]
    #[case("N/1234/keepalive", Some("keepalive"))]
    #[case("N/12345/Battery/Soc", None)]
    #[case("N/1234/", None)]
    #[case("W/1234/Battery/Soc", None)]
    fn test_notification_path(#[case] topic: &str, #[case] expected: Option<&str>) {
        assert_eq!(notification_path(topic, "1234"), expected);
    }
}
