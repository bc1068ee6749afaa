//! Benchmarks for tree lookup and mutation

use criterion::{criterion_group, criterion_main, Criterion};

use keyhive::tree::{Attributes, CreateOptions, Registry, ValueType};

fn w(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn populated_registry() -> Registry {
    let mut registry = Registry::new();
    let root = registry.root();
    for a in 0..20 {
        for b in 0..20 {
            let path = w(&format!("Machine\\Software\\Vendor{a}\\Product{b}"));
            let (key, _) = registry
                .create_key(
                    root,
                    &path,
                    None,
                    CreateOptions::default(),
                    Attributes::empty(),
                    None,
                    1,
                )
                .unwrap();
            registry
                .set_value(key, &w("Version"), ValueType::DWORD, &b.to_le_bytes())
                .unwrap();
        }
    }
    registry
}

fn lookup_benchmarks(c: &mut Criterion) {
    let registry = populated_registry();
    let root = registry.root();
    let path = w("Machine\\Software\\Vendor10\\Product10");

    c.bench_function("deep_lookup", |bencher| {
        bencher.iter(|| {
            registry
                .open_key(root, std::hint::black_box(&path), Attributes::empty())
                .unwrap()
        })
    });

    c.bench_function("set_value_identical", |bencher| {
        let mut registry = populated_registry();
        let root = registry.root();
        let key = registry.open_key(root, &path, Attributes::empty()).unwrap();
        registry
            .set_value(key, &w("Version"), ValueType::DWORD, &7u32.to_le_bytes())
            .unwrap();
        bencher.iter(|| {
            registry
                .set_value(key, &w("Version"), ValueType::DWORD, &7u32.to_le_bytes())
                .unwrap()
        })
    });
}

criterion_group!(benches, lookup_benchmarks);
criterion_main!(benches);
