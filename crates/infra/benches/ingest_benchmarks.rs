use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use curator_core::ArticleId;
use curator_infra::jobs::queue::build_request_jsonl;
use curator_infra::jobs::{ArticleInput, Chunk, parse_result_blob};

const DIMENSIONS: usize = 1536;

/// Result blob with `lines` embeddings, every tenth line an error descriptor.
fn result_blob(lines: usize) -> String {
    let embedding: Vec<f64> = (0..DIMENSIONS).map(|i| i as f64 / DIMENSIONS as f64).collect();
    (0..lines)
        .map(|i| {
            let custom_id = format!(r#"{{"articleId":"article-{i}","userId":"user-1"}}"#);
            if i % 10 == 9 {
                serde_json::json!({
                    "custom_id": custom_id,
                    "response": null,
                    "error": { "code": "server_error", "message": "failed" }
                })
            } else {
                serde_json::json!({
                    "custom_id": custom_id,
                    "response": { "status_code": 200, "body": { "data": [{ "embedding": embedding }] } },
                    "error": null
                })
            }
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn chunk(articles: usize) -> Chunk {
    Chunk {
        index: 0,
        articles: (0..articles)
            .map(|i| ArticleInput {
                article_id: ArticleId::new(format!("article-{i}")).unwrap(),
                text: "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(40),
            })
            .collect(),
        retry_count: 0,
        owner_id: None,
    }
}

fn bench_parse_result_blob(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_result_blob");

    for lines in [10usize, 100, 500] {
        let blob = result_blob(lines);
        group.throughput(Throughput::Bytes(blob.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &blob, |b, blob| {
            b.iter(|| parse_result_blob(black_box(blob), Some(0.0)));
        });
    }

    group.finish();
}

fn bench_build_request_jsonl(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_request_jsonl");

    for articles in [10usize, 100] {
        let chunk = chunk(articles);
        group.throughput(Throughput::Elements(articles as u64));
        group.bench_with_input(BenchmarkId::from_parameter(articles), &chunk, |b, chunk| {
            b.iter(|| build_request_jsonl(black_box(chunk), "text-embedding-3-small"));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_result_blob, bench_build_request_jsonl);
criterion_main!(benches);
