use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use shepherd::masking::{mask, unmask, ConfigMasker, MASKED_VALUE};
use shepherd::section::ConfigSection;
use shepherd::store::MemoryConfigStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn upload_monitor_section(platforms: usize) -> ConfigSection {
    let mut section = ConfigSection::from_value(json!({
        "check_interval": 30,
        "completed_column": 8,
        "concurrent_uploads": 1,
        "sheet_url": "https://docs.google.com/spreadsheets/d/example",
        "site_id": "editor",
        "site_pw": "correct horse battery staple",
        "platforms": {
            "golftimes": {"site_id": "editor", "site_pw": "another secret"}
        }
    }))
    .unwrap();

    // Padding fields make the section closer to a real one
    for i in 0..platforms {
        section.set_path(
            &format!("platforms.extra_{i}"),
            json!({"enabled": i % 2 == 0, "retries": i}),
        );
    }
    section
}

fn bench_mask(c: &mut Criterion) {
    let section = upload_monitor_section(20);

    c.bench_function("mask_upload_monitor", |b| {
        b.iter(|| black_box(mask("upload_monitor", black_box(&section))));
    });
}

fn bench_unmask(c: &mut Criterion) {
    let stored = upload_monitor_section(20);
    let supplied = mask("upload_monitor", &stored);

    c.bench_function("unmask_upload_monitor", |b| {
        b.iter(|| {
            black_box(unmask(
                "upload_monitor",
                black_box(&supplied),
                black_box(&stored),
            ))
        });
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let section = upload_monitor_section(200);

    c.bench_function("fingerprint_large_section", |b| {
        b.iter(|| black_box(section.fingerprint()));
    });
}

fn bench_resolve_for_launch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut sections = BTreeMap::new();
    sections.insert("upload_monitor".to_string(), upload_monitor_section(20));
    let masker = ConfigMasker::new(Arc::new(MemoryConfigStore::with_sections(sections)));
    let supplied = ConfigSection::from_value(json!({
        "site_pw": MASKED_VALUE,
        "check_interval": 60
    }))
    .unwrap();

    c.bench_function("resolve_for_launch", |b| {
        b.iter(|| {
            let resolved = rt
                .block_on(masker.resolve_for_launch("upload_monitor", &supplied))
                .unwrap();
            black_box(resolved);
        });
    });
}

criterion_group!(
    benches,
    bench_mask,
    bench_unmask,
    bench_fingerprint,
    bench_resolve_for_launch
);
criterion_main!(benches);
