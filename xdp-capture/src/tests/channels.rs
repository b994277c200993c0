// Channel queries against loopback: its driver has no channel support,
// which is exactly the soft-fallback path drivers like veth take too.

#[test]
fn loopback_counts_as_one_queue() {
    assert_eq!(crate::channels::max_queues("lo").unwrap(), 1);
    assert_eq!(crate::channels::current_queues("lo").unwrap(), 1);
}

#[test]
fn single_queue_needs_no_channel_support() {
    assert_eq!(crate::channels::set_queue_count("lo", 1).unwrap(), 1);
}

#[test]
fn multi_queue_without_channel_support_fails() {
    assert!(crate::channels::set_queue_count("lo", 4).is_err());
}

#[test]
fn interface_name_length_is_checked() {
    let long = "x".repeat(32);
    assert!(crate::channels::max_queues(&long).is_err());
}
