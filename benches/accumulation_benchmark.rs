//! Per-cycle hot path: table extraction and counter reconciliation
//!
//! An account page holds a few hundred rows at most; both steps run once per
//! account per cycle.

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use xiaoba_crawler::domain::{AccumulationEngine, KeywordScanner, RawRecord};
use xiaoba_crawler::infrastructure::TableExtractor;
use xiaoba_crawler::infrastructure::config::defaults::ANOMALY_KEYWORDS;
use xiaoba_crawler::test_utils::dashboard_html_with;

fn rows(count: i64, offset: i64) -> Vec<RawRecord> {
    (1..=count)
        .map(|i| RawRecord {
            account_username: "bench".into(),
            sequence_number: i,
            ip: format!("10.0.{}.{}", i / 256, i % 256),
            category: "师门".into(),
            display_name: format!("角色{i}"),
            level: i,
            guild_name: "天策".into(),
            skill_tag: "破军".into(),
            count_current: (i + offset) % 20,
            count_total: 20,
            elapsed_time: "01:30:00".into(),
            status_text: if i % 7 == 0 { "掉线 重连中".into() } else { "正常".into() },
            runtime: "02:00:00".into(),
        })
        .collect()
}

fn reconcile(c: &mut Criterion) {
    let scanner = KeywordScanner::new(ANOMALY_KEYWORDS.iter().copied());
    let mut group = c.benchmark_group("reconcile_cycle");

    for size in [50_i64, 200, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut engine = AccumulationEngine::new("bench", scanner.clone());
            engine.observe_all(rows(size, 0), Utc::now());
            let mut offset = 0;
            b.iter(|| {
                offset += 3;
                black_box(engine.observe_all(rows(size, offset), Utc::now()))
            });
        });
    }
    group.finish();
}

fn extract(c: &mut Criterion) {
    let Ok(extractor) = TableExtractor::new() else {
        return;
    };
    let page_rows: Vec<(i64, i64, &str)> = (1..=200).map(|i| (i, i % 20, "正常")).collect();
    let html = dashboard_html_with(&page_rows);

    c.bench_function("extract_200_rows", |b| {
        b.iter(|| black_box(extractor.extract("bench", black_box(&html))));
    });
}

criterion_group!(benches, reconcile, extract);
criterion_main!(benches);
