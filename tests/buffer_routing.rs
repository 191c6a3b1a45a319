//! Raw buffer routing between Unicam and the ISP input, with both devices
//! simulated and their completions interleaved pseudo-randomly.

use std::collections::VecDeque;
use std::time::Duration;

use isp_capture::error::{Error, Result};
use isp_capture::v4l2::{hand_off, BufferQueue, BufferState, Dequeued, Ledger};

const POOL: usize = 4;

/// A device that finishes queued buffers in order when told to.
struct SimQueue {
    name: String,
    ledger: Ledger,
    in_flight: VecDeque<u32>,
    done: VecDeque<u32>,
    sequence: u32,
}

impl SimQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ledger: Ledger::new(POOL),
            in_flight: VecDeque::new(),
            done: VecDeque::new(),
            sequence: 0,
        }
    }

    fn complete_one(&mut self) {
        if let Some(index) = self.in_flight.pop_front() {
            self.done.push_back(index);
        }
    }

    fn queued(&self, index: u32) -> bool {
        self.ledger.state(index) == Some(BufferState::Queued)
    }
}

impl BufferQueue for SimQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        self.ledger.queue(&self.name, index)?;
        self.in_flight.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<Dequeued>> {
        let Some(index) = self.done.pop_front() else {
            return Ok(None);
        };
        self.ledger.dequeue(&self.name, index)?;
        self.sequence += 1;
        Ok(Some(Dequeued {
            index,
            bytesused: 0,
            sequence: self.sequence,
            timestamp: Duration::ZERO,
        }))
    }
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn started() -> (SimQueue, SimQueue) {
    let mut unicam = SimQueue::new("unicam");
    let isp_in = SimQueue::new("isp-in");
    for index in 0..POOL as u32 {
        unicam.enqueue(index).unwrap();
    }
    (unicam, isp_in)
}

#[test]
fn test_every_buffer_owned_by_exactly_one_device() {
    for seed in [1u64, 0x9e37_79b9_7f4a_7c15, 0xdead_beef] {
        let (mut unicam, mut isp_in) = started();
        let mut rng = XorShift(seed);
        let mut to_isp = 0usize;
        let mut to_unicam = 0usize;

        for _ in 0..10_000 {
            match rng.next() % 4 {
                0 => unicam.complete_one(),
                1 => isp_in.complete_one(),
                2 => to_isp += hand_off(&mut unicam, &mut isp_in).unwrap().map_or(0, |_| 1),
                _ => to_unicam += hand_off(&mut isp_in, &mut unicam).unwrap().map_or(0, |_| 1),
            }
            for index in 0..POOL as u32 {
                assert!(
                    unicam.queued(index) ^ isp_in.queued(index),
                    "buffer {index} owned by both or neither"
                );
            }
        }

        assert!(to_isp > 100, "seed {seed:#x} moved only {to_isp} frames");
        assert!(to_unicam <= to_isp);
        assert!(to_isp - to_unicam <= POOL);
        assert_eq!(unicam.ledger.queued() + isp_in.ledger.queued(), POOL);
    }
}

#[test]
fn test_nothing_ready_moves_nothing() {
    let (mut unicam, mut isp_in) = started();
    assert_eq!(hand_off(&mut unicam, &mut isp_in).unwrap(), None);
    assert_eq!(hand_off(&mut isp_in, &mut unicam).unwrap(), None);
    assert_eq!(unicam.ledger.queued(), POOL);
}

#[test]
fn test_index_is_preserved_across_hand_off() {
    let (mut unicam, mut isp_in) = started();
    unicam.complete_one();
    unicam.complete_one();
    assert_eq!(hand_off(&mut unicam, &mut isp_in).unwrap(), Some(0));
    assert_eq!(hand_off(&mut unicam, &mut isp_in).unwrap(), Some(1));
    isp_in.complete_one();
    assert_eq!(hand_off(&mut isp_in, &mut unicam).unwrap(), Some(0));
    assert!(unicam.queued(0) && isp_in.queued(1));
}

#[test]
fn test_double_enqueue_is_rejected() {
    let (mut unicam, _) = started();
    let err = unicam.enqueue(2).unwrap_err();
    assert!(matches!(
        err,
        Error::BufferState {
            index: 2,
            state: BufferState::Queued,
            ..
        }
    ));
}
