use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use interpose::pattern::{compile, RoutePattern};

const URLS: [&str; 4] = [
    "http://localhost:3000/api/data",
    "https://cdn.example.com/assets/v3/app.bundle.js?cache=123",
    "https://example.com/v1/nested/deep/path/api/users/42",
    "http://example.com/static/logo.png",
];

fn bench_pattern_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_match");

    for source in ["**", "**/api/**", "https://*.example.com/**/*.{js,css}", "re:/users/\\d+$"] {
        let pattern: RoutePattern = compile(source).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(source), &pattern, |b, pattern| {
            b.iter(|| {
                URLS.iter()
                    .filter(|url| pattern.matches(black_box(url), "GET"))
                    .count()
            });
        });
    }

    group.finish();
}

fn bench_pattern_compile(c: &mut Criterion) {
    c.bench_function("pattern_compile", |b| {
        b.iter(|| compile(black_box("https://{api,cdn}.example.com/**/v*/items/*.json")).unwrap());
    });
}

criterion_group!(benches, bench_pattern_match, bench_pattern_compile);
criterion_main!(benches);
