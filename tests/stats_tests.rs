use cube::stats::{CpuTimes, MemInfo, Stats};

#[test]
fn test_cpu_usage_derivation() {
    let stats = Stats {
        cpu_stats: CpuTimes {
            user: 200,
            nice: 0,
            system: 100,
            idle: 600,
            iowait: 100,
            irq: 0,
            softirq: 0,
            steal: 0,
        },
        ..Default::default()
    };

    let (percent, idle, non_idle, total) = stats.cpu_usage();
    assert_eq!(idle, 700.0);
    assert_eq!(non_idle, 300.0);
    assert_eq!(total, 1000.0);
    assert!((percent - 0.3).abs() < 1e-12);
}

#[test]
fn test_cpu_usage_with_empty_counters() {
    let stats = Stats::default();
    let (percent, idle, non_idle, total) = stats.cpu_usage();
    assert_eq!(percent, 0.0);
    assert_eq!(idle, 0.0);
    assert_eq!(non_idle, 0.0);
    assert_eq!(total, 0.0);
}

#[test]
fn test_memory_helpers() {
    let stats = Stats {
        mem_stats: MemInfo {
            total_kb: 16_000_000,
            available_kb: 12_000_000,
            used_kb: 4_000_000,
            used_percent: 25.0,
        },
        ..Default::default()
    };

    assert_eq!(stats.mem_total_kb(), 16_000_000);
    assert_eq!(stats.mem_available_kb(), 12_000_000);
    assert_eq!(stats.mem_used_kb(), 4_000_000);
}

#[test]
fn test_collect_stamps_task_count() {
    let stats = Stats::collect(7);
    assert_eq!(stats.task_count, 7);
    // A live host has memory.
    assert!(stats.mem_total_kb() > 0);
}

#[test]
fn test_stats_round_trip_through_json() {
    let stats = Stats::collect(2);
    let encoded = serde_json::to_string(&stats).unwrap();
    let decoded: Stats = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.task_count, 2);
    assert_eq!(decoded.mem_total_kb(), stats.mem_total_kb());
    assert_eq!(decoded.disk_total(), stats.disk_total());
}
