//! 순서 게이트
//!
//! 여러 작업자가 병렬로 만든 결과를 분류기가 매긴 순번 순서대로 내보낸다.
//! 재정렬 버퍼 없이 "다음 차례" 카운터 하나만 두고, 자기 차례가 아닌 작업자는
//! 조건 변수에서 기다린다. 큰 이벤트 하나가 늦으면 뒤의 결과도 모두 기다린다.
//!
//! 잠금은 카운터에만 쓴다. 내보내는 동안에는 잠금을 쥐지 않으므로
//! 출력이 막혀도 `abort()`와 `is_aborted()`는 기다리지 않는다.

use crate::error::{BinlogSqlError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct OrderingGate {
    next: Mutex<u64>,
    aborted: AtomicBool,
    turn: Condvar,
}

impl OrderingGate {
    /// `first`: 처음 내보낼 순번
    pub fn new(first: u64) -> Self {
        OrderingGate {
            next: Mutex::new(first),
            aborted: AtomicBool::new(false),
            turn: Condvar::new(),
        }
    }

    /// `seq` 차례가 올 때까지 기다렸다가 `deliver`를 실행하고 카운터를 올린다.
    ///
    /// 카운터는 차례를 가진 작업자만 올리므로 `deliver`는 잠금 밖에서 실행해도 순서가 지켜진다.
    /// `deliver`가 실패하거나 게이트가 중단되면 기다리던 작업자는 모두 `Aborted`로 깨어난다.
    pub fn release<T>(&self, seq: u64, deliver: impl FnOnce() -> Result<T>) -> Result<T> {
        {
            let mut next = self.next.lock();
            if seq < *next {
                return Err(BinlogSqlError::Other(format!(
                    "순번 {}는 이미 내보냄 (다음 순번 {})",
                    seq, *next
                )));
            }
            while *next != seq && !self.is_aborted() {
                self.turn.wait(&mut next);
            }
        }
        if self.is_aborted() {
            return Err(BinlogSqlError::Aborted);
        }

        let result = deliver();
        match result {
            Ok(_) => {
                *self.next.lock() += 1;
                self.turn.notify_all();
            }
            Err(_) => self.abort(),
        }
        result
    }

    /// 기다리는 작업자를 모두 깨워 중단시킨다
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        // 검사와 wait 사이에 끼어든 작업자가 신호를 놓치지 않도록 잠금을 한 번 거친다
        drop(self.next.lock());
        self.turn.notify_all();
    }

    /// 잠금 없이 읽는다
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// 다음에 내보낼 순번
    pub fn next_seq(&self) -> u64 {
        *self.next.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_release_in_sequence_order() {
        const WORKERS: u64 = 4;
        const EVENTS: u64 = 64;

        let gate = Arc::new(OrderingGate::new(1));
        let released = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let gate = Arc::clone(&gate);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    // 작업자 w는 w+1, w+1+WORKERS, ... 순번을 맡는다
                    let mut seq = w + 1;
                    while seq <= EVENTS {
                        thread::sleep(Duration::from_micros((EVENTS - seq) * 37 % 500));
                        gate.release(seq, || {
                            released.lock().push(seq);
                            Ok(())
                        })
                        .unwrap();
                        seq += WORKERS;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let released = released.lock();
        assert_eq!(*released, (1..=EVENTS).collect::<Vec<_>>());
        assert_eq!(gate.next_seq(), EVENTS + 1);
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let gate = Arc::new(OrderingGate::new(1));
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.release(2, || Ok(())))
        };

        thread::sleep(Duration::from_millis(20));
        gate.abort();
        assert!(matches!(waiter.join().unwrap(), Err(BinlogSqlError::Aborted)));
        assert!(gate.is_aborted());
    }

    #[test]
    fn test_failed_delivery_aborts_gate() {
        let gate = OrderingGate::new(1);
        let err = gate
            .release(1, || -> Result<()> { Err(BinlogSqlError::IoError("disk full".to_string())) })
            .unwrap_err();
        assert!(matches!(err, BinlogSqlError::IoError(_)));
        assert!(matches!(gate.release(1, || Ok(())), Err(BinlogSqlError::Aborted)));
        assert_eq!(gate.next_seq(), 1);
    }

    #[test]
    fn test_abort_does_not_wait_for_delivery() {
        let gate = Arc::new(OrderingGate::new(1));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();

        let deliverer = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.release(1, || {
                    entered_tx.send(()).unwrap();
                    // 출력이 막힌 상황
                    resume_rx.recv().unwrap();
                    Ok(())
                })
            })
        };

        entered_rx.recv().unwrap();
        assert!(!gate.is_aborted());
        gate.abort();
        assert!(gate.is_aborted());
        assert!(matches!(gate.release(2, || Ok(())), Err(BinlogSqlError::Aborted)));

        resume_tx.send(()).unwrap();
        deliverer.join().unwrap().unwrap();
    }

    #[test]
    fn test_stale_sequence_is_rejected() {
        let gate = OrderingGate::new(1);
        gate.release(1, || Ok(())).unwrap();
        assert!(gate.release(1, || Ok(())).is_err());
    }
}
