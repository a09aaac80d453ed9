use super::*;

fn parser() -> TagParser {
    TagParser::new("urlprefix-")
}

#[test]
fn test_parse_cdn_no_affinity() {
    let info = parser()
        .parse("urlprefix-cdn:noaffinity:host1.com/")
        .unwrap();
    assert_eq!(info.raw, "urlprefix-cdn:noaffinity:host1.com/");
    assert!(info.cdn);
    assert_eq!(info.affinity, Affinity::None);
    assert_eq!(info.host, "host1.com");
    assert_eq!(info.path, "/");
}

#[test]
fn test_parse_nocdn_ip_affinity() {
    let info = parser()
        .parse("urlprefix-nocdn:ipaffinity:host2.com/test")
        .unwrap();
    assert!(!info.cdn);
    assert_eq!(info.affinity, Affinity::ClientIp);
    assert_eq!(info.host, "host2.com");
    assert_eq!(info.path, "/test");
}

#[test]
fn test_parse_ipport_affinity() {
    let info = parser()
        .parse("urlprefix-nocdn:ipportaffinity:api.example.com/v1/items")
        .unwrap();
    assert_eq!(info.affinity, Affinity::ClientIpPort);
    assert_eq!(info.path, "/v1/items");
}

#[test]
fn test_parse_rejects_malformed_tags() {
    let malformed = [
        "",
        "urlprefix-",
        "cdn:noaffinity:host.com/",
        "urlprefix-cdn:noaffinity:host.com",
        "urlprefix-maybecdn:noaffinity:host.com/",
        "urlprefix-cdn:someaffinity:host.com/",
        "urlprefix-cdn:noaffinity:HOST.COM/",
        "urlprefix-cdn:noaffinity:/path-only",
        "other-cdn:noaffinity:host.com/",
    ];
    let parser = parser();
    for tag in malformed {
        assert!(
            matches!(parser.parse(tag), Err(DaemonError::MalformedTag(_))),
            "expected {:?} to be rejected",
            tag
        );
    }
}

#[test]
fn test_group_key() {
    let info = parser()
        .parse("urlprefix-cdn:noaffinity:api.example.com/")
        .unwrap();
    assert_eq!(info.group(), "cdn-none-api-example-com");

    let info = parser()
        .parse("urlprefix-nocdn:ipaffinity:api.example.com/v1")
        .unwrap();
    assert_eq!(info.group(), "nocdn-ip-api-example-com");

    let info = parser()
        .parse("urlprefix-nocdn:ipportaffinity:a.b.c/")
        .unwrap();
    assert_eq!(info.group(), "nocdn-ipport-a-b-c");
}

#[test]
fn test_resource_name_short() {
    assert_eq!(
        resource_name("neg", "cdn-none-api-example-com"),
        "neg-cdn-none-api-example-com"
    );
}

#[test]
fn test_resource_name_truncates_to_the_cap() {
    let group = "cdn-none-".to_string() + &"a".repeat(80);
    let name = resource_name("bs", &group);
    assert_eq!(name.len(), MAX_RESOURCE_NAME_LEN);
    assert!(name.starts_with("bs-cdn-none-"));
}

#[test]
fn test_resource_name_strips_trailing_dash_after_truncation() {
    // 60 characters of group put the dash introduced by joining exactly at
    // the cut point.
    let group = "a".repeat(59) + "-bcd";
    let name = resource_name("hc", &group);
    assert!(name.len() <= MAX_RESOURCE_NAME_LEN);
    assert!(!name.ends_with('-'), "got {:?}", name);
}

#[test]
fn test_resource_name_is_stable() {
    let group = "nocdn-ip-api-example-com";
    assert_eq!(resource_name("neg", group), resource_name("neg", group));
}
