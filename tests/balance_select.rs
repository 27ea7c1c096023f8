//! Load-balance selection under peer failure and recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use weft::balance::{
    LoadBalance, LoadBalanceItem, RequestOutcome, SessionHolder, Strategy,
};
use weft::error::SelectError;

struct TogglableHolder {
    connected: AtomicBool,
}

impl TogglableHolder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
        })
    }
}

impl SessionHolder for TogglableHolder {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn now_s() -> u64 {
    weft::timer::monotonic_ms() / 1000
}

#[test]
fn fair_balance_degrades_failing_peer_and_recovers() {
    // Three peers with identical base weight; peer 3 starts failing.
    let balance = LoadBalance::new(Strategy::Fair);
    let holders: Vec<Arc<TogglableHolder>> = (0..3).map(|_| TogglableHolder::new()).collect();
    for (id, holder) in holders.iter().enumerate() {
        balance.add(LoadBalanceItem::new(
            id as u64 + 1,
            Arc::clone(holder) as Arc<dyn SessionHolder>,
            10,
        ));
    }

    let t = now_s();
    // Warm-up traffic: everyone healthy.
    for id in 1..=3u64 {
        let item = balance.get_by_id(id).expect("item");
        for _ in 0..20 {
            item.on_issue(t);
            item.on_complete(t, 5, RequestOutcome::Ok);
        }
    }

    // Peer 3 turns into an error machine.
    let failing = balance.get_by_id(3).expect("item");
    for _ in 0..200 {
        failing.on_issue(t);
        failing.on_complete(t, 5, RequestOutcome::Error);
    }

    let mut shares = HashMap::new();
    for hint in 0..10_000u64 {
        let picked = balance.get(hint).expect("live peers exist");
        *shares.entry(picked.id()).or_insert(0u32) += 1;
    }
    let failing_share = f64::from(shares.get(&3).copied().unwrap_or(0)) / 10_000.0;
    assert!(
        failing_share < 0.10,
        "failing peer keeps {:.1}% of traffic",
        failing_share * 100.0
    );

    // Recovery: let the error buckets age out of the window, then give
    // every peer identical fresh traffic.
    std::thread::sleep(std::time::Duration::from_millis(5200));
    let t = now_s();
    for id in 1..=3u64 {
        let item = balance.get_by_id(id).expect("item");
        for _ in 0..20 {
            item.on_issue(t);
            item.on_complete(t, 5, RequestOutcome::Ok);
        }
    }
    let mut shares = HashMap::new();
    for hint in 0..10_000u64 {
        let picked = balance.get(hint).expect("live peers exist");
        *shares.entry(picked.id()).or_insert(0u32) += 1;
    }
    let healthy_share = f64::from(shares[&1]) / 10_000.0;
    let recovered_share = f64::from(shares.get(&3).copied().unwrap_or(0)) / 10_000.0;
    assert!(
        (recovered_share - healthy_share).abs() < 0.10,
        "recovered {:.1}% vs healthy {:.1}%",
        recovered_share * 100.0,
        healthy_share * 100.0
    );
}

#[test]
fn fair_balance_excludes_disconnected_then_reports_no_connection() {
    let balance = LoadBalance::new(Strategy::Fair);
    let holders: Vec<Arc<TogglableHolder>> = (0..2).map(|_| TogglableHolder::new()).collect();
    for (id, holder) in holders.iter().enumerate() {
        balance.add(LoadBalanceItem::new(
            id as u64 + 1,
            Arc::clone(holder) as Arc<dyn SessionHolder>,
            10,
        ));
    }

    holders[0].close();
    for hint in 0..100 {
        assert_eq!(balance.get(hint).expect("peer 2 lives").id(), 2);
    }

    holders[1].close();
    assert_eq!(balance.get(0).unwrap_err(), SelectError::NoConnection);
}

#[test]
fn weighted_sum_positive_implies_selection() {
    let balance = LoadBalance::new(Strategy::Weighted);
    balance.add(LoadBalanceItem::new(
        1,
        TogglableHolder::new() as Arc<dyn SessionHolder>,
        0,
    ));
    balance.add(LoadBalanceItem::new(
        2,
        TogglableHolder::new() as Arc<dyn SessionHolder>,
        5,
    ));
    // Total weight is positive, so every hint resolves to a live item.
    for hint in 0..50 {
        assert!(balance.get(hint).is_ok());
    }
}

#[test]
fn round_robin_share_is_uniform_under_churn() {
    let balance = LoadBalance::new(Strategy::RoundRobin);
    for id in 1..=4u64 {
        balance.add(LoadBalanceItem::new(
            id,
            TogglableHolder::new() as Arc<dyn SessionHolder>,
            1,
        ));
    }
    balance.del(4);
    let mut counts = HashMap::new();
    for _ in 0..300 {
        let picked = balance.get(u64::MAX).expect("live");
        *counts.entry(picked.id()).or_insert(0u32) += 1;
    }
    assert_eq!(counts.len(), 3);
    for id in 1..=3u64 {
        assert_eq!(counts[&id], 100, "uniform share for {id}");
    }
}
