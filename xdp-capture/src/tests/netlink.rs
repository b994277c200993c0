#[test]
fn list_links() {
    let _ = env_logger::builder().is_test(true).try_init();
    let links = crate::netlink::get_links().unwrap();
    assert!(!links.is_empty());
    for link in &links {
        println!("Link: {:#?}", link);
    }
    // Loopback exists everywhere.
    assert!(links.iter().any(|l| l.name == "lo"));
}

#[test]
fn find_link_resolves_loopback() {
    let lo = crate::netlink::find_link("lo").unwrap();
    assert_eq!(lo.name, "lo");
    assert!(lo.if_index > 0);
}

#[test]
fn find_link_unknown_device() {
    let err = crate::netlink::find_link("definitely-not-a-nic0").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn mac_formats_as_plain_hex() {
    let link = crate::netlink::Link {
        mac: [0x00, 0x1b, 0x44, 0x11, 0x3a, 0xb7],
        ..Default::default()
    };
    assert_eq!(link.mac_string(), "00:1b:44:11:3a:b7");
    assert_eq!(crate::netlink::Link::default().mac_string(), "00:00:00:00:00:00");
}
