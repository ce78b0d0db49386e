use basalt_core::ErrorKind;
use basalt_queue::{MsgChannel, PollBudget, QueueOptions, ShmRingQueue};
use basalt_segment::{SegmentKey, ShmNamespace};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::Duration;

const KEY: SegmentKey = SegmentKey(1335);

fn namespace(label: &str) -> ShmNamespace {
    let pid = std::process::id();
    let dir = PathBuf::from(format!("/tmp/basalt_test_{label}_{pid}"));
    let _ = std::fs::remove_dir_all(&dir);
    ShmNamespace::in_dir(dir)
}

fn cleanup(ns: &ShmNamespace) {
    let _ = std::fs::remove_dir_all(ns.segment_dir());
}

fn header_region(q: &ShmRingQueue) -> Vec<u8> {
    std::fs::read(q.path()).unwrap()[..1024].to_vec()
}

#[test]
fn messages_come_out_in_order() {
    let ns = namespace("fifo");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 1024)).unwrap();

    let msgs: [&[u8]; 4] = [b"alpha", b"bb", b"", b"the last one"];
    for msg in msgs {
        q.enqueue(msg).unwrap();
    }
    assert_eq!(q.len().unwrap(), 4);

    let mut out = Vec::new();
    while let Ok(entry) = q.dequeue() {
        out.push(entry.payload);
    }
    assert_eq!(out, vec![b"alpha".to_vec(), b"bb".to_vec(), vec![], b"the last one".to_vec()]);
    assert_eq!(q.dequeue().unwrap_err().kind(), ErrorKind::Empty);
    assert!(q.is_empty().unwrap());

    cleanup(&ns);
}

#[test]
fn depth_four_holds_three() {
    let ns = namespace("depth4");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 1024)).unwrap();

    for i in 0..3u8 {
        q.enqueue(&[i; 8]).unwrap();
    }
    assert!(q.is_full().unwrap());

    let before = header_region(&q);
    let err = q.enqueue(b"one too many").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Full);
    assert_eq!(header_region(&q), before, "a rejected enqueue must not touch the header");
    assert_eq!(q.len().unwrap(), 3);

    let first = q.dequeue().unwrap();
    assert_eq!(first.qidx, 0);
    assert_eq!(first.payload, vec![0; 8]);
    q.enqueue(b"fits now").unwrap();

    let drained: Vec<_> = std::iter::from_fn(|| q.dequeue().ok()).map(|e| e.payload).collect();
    assert_eq!(drained, vec![vec![1; 8], vec![2; 8], b"fits now".to_vec()]);

    cleanup(&ns);
}

#[test]
fn depth_four_fills_at_three_outstanding() {
    let ns = namespace("depth4_sequence");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 1024)).unwrap();

    let msgs: [&[u8]; 3] = [b"a", b"bb", b"ccc"];
    for msg in msgs {
        q.enqueue(msg).unwrap();
    }
    assert_eq!(q.dequeue().unwrap().payload, b"a");
    assert_eq!(q.dequeue().unwrap().payload, b"bb");

    q.enqueue(b"dddd").unwrap();
    assert!(!q.is_full().unwrap());
    q.enqueue(b"eeeee").unwrap();
    assert_eq!(q.len().unwrap(), 3);
    assert!(q.is_full().unwrap());
    assert_eq!(q.enqueue(b"f").unwrap_err().kind(), ErrorKind::Full);

    let drained: Vec<_> = std::iter::from_fn(|| q.dequeue().ok()).map(|e| e.payload).collect();
    assert_eq!(drained, vec![b"ccc".to_vec(), b"dddd".to_vec(), b"eeeee".to_vec()]);

    cleanup(&ns);
}

#[test]
fn long_lock_dir_does_not_overflow_the_header() {
    let pid = std::process::id();
    let root = PathBuf::from(format!("/tmp/basalt_test_long_lock_{pid}"));
    let _ = std::fs::remove_dir_all(&root);
    let lock_dir = (0..4).fold(root.clone(), |dir, i| dir.join(format!("{i}{}", "d".repeat(200))));
    assert!(lock_dir.as_os_str().len() > 800);
    let ns = ShmNamespace::new(root.join("segments"), &lock_dir);

    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 1024)).unwrap();
    assert_eq!(q.cached_header().lock_filename, "basalt.lock_1335");
    assert!(ns.lock_path(KEY).exists());

    q.enqueue(b"fits").unwrap();
    assert_eq!(q.dequeue().unwrap().payload, b"fits");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn arena_wraps_to_the_front() {
    let ns = namespace("wrap");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 16)).unwrap();

    q.enqueue(&[b'a'; 10]).unwrap();
    q.enqueue(&[b'b'; 4]).unwrap();
    assert_eq!(q.dequeue().unwrap().payload, vec![b'a'; 10]);

    q.enqueue(&[b'c'; 6]).unwrap();

    let b = q.dequeue().unwrap();
    assert_eq!((b.msg_offset, b.msg_len), (10, 4));
    let c = q.dequeue().unwrap();
    assert_eq!((c.msg_offset, c.msg_len), (0, 6));
    assert_eq!(c.payload, vec![b'c'; 6]);

    cleanup(&ns);
}

#[test]
fn arena_exhaustion_is_full_and_harmless() {
    let ns = namespace("arena_full");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 16)).unwrap();

    q.enqueue(&[1; 10]).unwrap();
    let before = header_region(&q);
    let err = q.enqueue(&[2; 7]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Full);
    assert_eq!(header_region(&q), before);

    let err = q.enqueue(&[3; 17]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadArgument);

    assert_eq!(q.dequeue().unwrap().payload, vec![1; 10]);
    // empty again, so the arena rewinds and the full 16 bytes are usable
    q.enqueue(&[4; 16]).unwrap();
    assert_eq!(q.dequeue().unwrap().msg_offset, 0);

    cleanup(&ns);
}

#[test]
fn two_handles_share_one_queue() {
    let ns = namespace("two_handles");
    let opts = QueueOptions::new(8, 1024);
    let mut producer = ShmRingQueue::attach(&ns, KEY, opts).unwrap();
    let mut consumer = ShmRingQueue::attach(&ns, KEY, opts).unwrap();

    producer.enqueue(b"ping").unwrap();
    assert!(consumer.generation_changed().unwrap());
    assert_eq!(consumer.dequeue().unwrap().payload, b"ping");

    assert!(producer.generation_changed().unwrap());
    assert_eq!(producer.len().unwrap(), 0);
    assert!(!producer.generation_changed().unwrap());

    cleanup(&ns);
}

#[test]
fn flipped_header_byte_is_corrupt() {
    let ns = namespace("corrupt");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 1024)).unwrap();
    q.enqueue(b"payload").unwrap();

    let region = header_region(&q);
    let needle = b"\"inPtr\":1";
    let pos = region
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(q.path()).unwrap();
    file.write_at(b"2", (pos + needle.len() - 1) as u64).unwrap();

    q.reset_local_generation();
    assert_eq!(q.dequeue().unwrap_err().kind(), ErrorKind::Corrupt);

    q.reinitialize().unwrap();
    assert!(q.is_empty().unwrap());
    q.enqueue(b"after").unwrap();
    assert_eq!(q.dequeue().unwrap().payload, b"after");

    cleanup(&ns);
}

#[test]
fn attach_recovers_a_corrupt_header() {
    let ns = namespace("attach_corrupt");
    let q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 1024)).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(q.path()).unwrap();
    file.write_at(b"[", 8).unwrap();
    q.close();

    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 1024)).unwrap();
    assert!(q.is_empty().unwrap());

    cleanup(&ns);
}

#[test]
fn geometry_mismatch_leaves_queue_alone() {
    let ns = namespace("mismatch");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 1024)).unwrap();
    q.enqueue(b"keep me").unwrap();

    let err = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(8, 1024)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);

    let err = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 4096)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);

    assert_eq!(q.dequeue().unwrap().payload, b"keep me");

    cleanup(&ns);
}

#[test]
fn delete_removes_the_segment() {
    let ns = namespace("delete");
    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 64)).unwrap();
    q.enqueue(b"gone").unwrap();
    let path = q.path().to_path_buf();

    q.delete().unwrap();
    assert!(!path.exists());

    let mut q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 64)).unwrap();
    assert_eq!(q.dequeue().unwrap_err().kind(), ErrorKind::Empty);

    cleanup(&ns);
}

#[test]
fn unlocked_queue_still_works() {
    let ns = namespace("unlocked");
    let opts = QueueOptions::new(4, 64).with_locking(false);
    let mut q = ShmRingQueue::attach(&ns, KEY, opts).unwrap();
    assert!(!q.cached_header().locking);
    assert!(!ns.lock_path(KEY).exists());

    q.enqueue(b"x").unwrap();
    assert_eq!(q.dequeue().unwrap().payload, b"x");

    cleanup(&ns);
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Request {
    op: String,
    key: u32,
}

#[test]
fn channel_round_trips_json() {
    let ns = namespace("channel");
    let requests = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(4, 1024)).unwrap();
    let replies = ShmRingQueue::attach(&ns, KEY.offset(1), QueueOptions::new(4, 1024)).unwrap();
    let tick = Duration::from_millis(1);
    let mut requests = MsgChannel::new(requests).with_intervals(tick, tick);
    let mut replies = MsgChannel::new(replies).with_intervals(tick, tick);

    let err = requests.recv(PollBudget::Retries(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Empty);

    // answer in advance so send_recv finds the reply waiting
    replies.send_json(&"ok", PollBudget::NoWait).unwrap();
    let req = Request {
        op: "get".into(),
        key: 7,
    };
    let answer: String = requests.send_recv(&mut replies, &req, PollBudget::NoWait).unwrap();
    assert_eq!(answer, "ok");

    let seen: Request = requests.recv_json(PollBudget::NoWait).unwrap();
    assert_eq!(seen, req);

    cleanup(&ns);
}

#[test]
fn channel_gives_up_when_full() {
    let ns = namespace("channel_full");
    let q = ShmRingQueue::attach(&ns, KEY, QueueOptions::new(2, 64)).unwrap();
    let tick = Duration::from_millis(1);
    let mut ch = MsgChannel::new(q).with_intervals(tick, tick);

    ch.send(b"only slot", PollBudget::NoWait).unwrap();
    let err = ch.send(b"no room", PollBudget::timeout(Duration::from_millis(20))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Full);
    assert_eq!(ch.queue().len().unwrap(), 1);

    cleanup(&ns);
}
