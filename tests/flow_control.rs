use logbus::{
    CountersManager, DriverContext, IpcPublication, Position, PublicationParams,
    SubscriberPosition, SystemCounters, TERM_MIN_LENGTH,
};
use tempfile::{tempdir, TempDir};

struct Fixture {
    _dir: TempDir,
    counters: CountersManager,
    system_counters: SystemCounters,
    context: DriverContext,
}

fn fixture(window: usize) -> Fixture {
    let dir = tempdir().expect("tempdir");
    let mut counters =
        CountersManager::create(&dir.path().join("counters.values"), 32).expect("counters");
    let system_counters = SystemCounters::new(&mut counters).expect("system counters");
    let context = DriverContext::new(dir.path()).with_publication_window_length(window);
    Fixture {
        _dir: dir,
        counters,
        system_counters,
        context,
    }
}

fn create_publication(fixture: &mut Fixture) -> IpcPublication {
    let pub_pos = fixture.counters.allocate("pub-pos").expect("pub pos");
    let pub_lmt = fixture.counters.allocate("pub-lmt").expect("pub lmt");
    IpcPublication::create(
        &fixture.context,
        7,
        1001,
        42,
        pub_pos,
        pub_lmt,
        0,
        &PublicationParams {
            term_length: TERM_MIN_LENGTH,
            mtu_length: 1408,
            is_sparse: true,
            replay: None,
        },
        false,
        &fixture.system_counters,
    )
    .expect("create publication")
}

fn attach_subscriber(
    fixture: &mut Fixture,
    publication: &mut IpcPublication,
    registration_id: i64,
) -> Position {
    let position = fixture.counters.allocate("sub-pos").expect("sub pos");
    position.set_ordered(publication.joining_position());
    publication.add_subscriber(SubscriberPosition::new(
        position.clone(),
        registration_id,
        true,
        0,
    ));
    position
}

#[test]
fn empty_subscribable_does_no_work() {
    let mut fixture = fixture(1024);
    let mut publication = create_publication(&mut fixture);

    let limit_before = publication.pub_lmt().get_volatile();
    assert_eq!(publication.update_pub_lmt(), 0);
    assert_eq!(publication.pub_lmt().get_volatile(), limit_before);
}

#[test]
fn single_tethered_subscriber_advances_window() {
    let mut fixture = fixture(1024);
    let mut publication = create_publication(&mut fixture);
    assert_eq!(publication.term_window_length(), 1024);
    assert_eq!(publication.trip_gain(), 128);

    attach_subscriber(&mut fixture, &mut publication, 100);

    assert_eq!(publication.update_pub_lmt(), 1);
    assert_eq!(publication.pub_lmt().get_volatile(), 1024);
    assert_eq!(publication.trip_limit(), 1152);
}

#[test]
fn no_subscriber_movement_is_idle() {
    let mut fixture = fixture(1024);
    let mut publication = create_publication(&mut fixture);
    attach_subscriber(&mut fixture, &mut publication, 100);

    assert_eq!(publication.update_pub_lmt(), 1);
    let limit = publication.pub_lmt().get_volatile();

    for _ in 0..10 {
        assert_eq!(publication.update_pub_lmt(), 0);
        assert_eq!(publication.pub_lmt().get_volatile(), limit);
    }
}

#[test]
fn limit_never_exceeds_slowest_subscriber_plus_window() {
    let mut fixture = fixture(1024);
    let mut publication = create_publication(&mut fixture);
    let window = publication.term_window_length();

    let subscribers: Vec<Position> = (0..3)
        .map(|i| attach_subscriber(&mut fixture, &mut publication, 100 + i))
        .collect();

    // Advance the subscribers unevenly and re-check the invariant after
    // every update.
    for step in 0..50i64 {
        for (index, subscriber) in subscribers.iter().enumerate() {
            let advance = (step + 1) * (index as i64 + 1) * 96;
            subscriber.set_ordered(advance);
        }
        publication.update_pub_lmt();

        let min_position = subscribers
            .iter()
            .map(|s| s.get_volatile())
            .min()
            .expect("positions");
        assert!(publication.pub_lmt().get_volatile() <= min_position + window);
        assert!(publication.clean_position() <= min_position);
    }
}

#[test]
fn cleaning_the_same_range_twice_is_identical() {
    let mut fixture = fixture(1024);
    let mut publication = create_publication(&mut fixture);

    let term = publication.raw_log().term(0);
    unsafe {
        std::ptr::write_bytes(term, 0x5A, 8192);
    }

    publication.clean_buffer(4096);
    let first_pass: Vec<u8> =
        unsafe { std::slice::from_raw_parts(term, 8192) }.to_vec();

    publication.clean_buffer(4096);
    let second_pass: Vec<u8> =
        unsafe { std::slice::from_raw_parts(term, 8192) }.to_vec();

    assert_eq!(first_pass, second_pass);
    assert!(first_pass[..4096].iter().all(|&b| b == 0));
    assert!(first_pass[4096..].iter().all(|&b| b == 0x5A));
}
