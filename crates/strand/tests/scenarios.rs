//! Shared driver/client scenarios from strand-testkit.

#[test]
fn add_publication_resolves() {
    strand_testkit::run_add_publication_resolves();
}

#[test]
fn silent_driver_times_out() {
    strand_testkit::run_silent_driver_times_out();
}

#[test]
fn publish_subscribe() {
    strand_testkit::run_publish_subscribe();
}

#[test]
fn slow_subscriber_blocks_publisher() {
    strand_testkit::run_slow_subscriber_blocks_publisher();
}

#[test]
fn client_close_releases_resources() {
    strand_testkit::run_client_close_releases_resources();
}
