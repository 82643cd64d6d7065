// Copyright 2024 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rill_parser::{parse_header_line, parse_request_line, HttpRequest};

const REQUEST_LINE: &[u8] = b"GET /search?q=rust&lang=en&page=2 HTTP/1.1";

const HEADERS: &[&[u8]] = &[
    b"Host: www.example.org",
    b"User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/118.0",
    b"Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    b"Accept-Language: en-US,en;q=0.5",
    b"Accept-Encoding: gzip, deflate, br",
    b"Connection: keep-alive",
    b"Cookie: sid=8f14e45fceea167a5a36dedd4bea2543; theme=dark; lang=en",
];

fn bench_request_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_line");
    group.throughput(Throughput::Bytes(REQUEST_LINE.len() as u64));
    group.bench_function("parse", |b| {
        b.iter(|| {
            let mut request = HttpRequest::new();
            parse_request_line(black_box(REQUEST_LINE), &mut request).expect("parses");
            request
        })
    });
    group.finish();
}

fn bench_headers(c: &mut Criterion) {
    let total: usize = HEADERS.iter().map(|h| h.len()).sum();
    let mut group = c.benchmark_group("headers");
    group.throughput(Throughput::Bytes(total as u64));
    group.bench_function("parse", |b| {
        b.iter(|| {
            let mut request = HttpRequest::new();
            for header in HEADERS {
                parse_header_line(black_box(header), &mut request);
            }
            request
        })
    });
    group.finish();
}

fn bench_cookies(c: &mut Criterion) {
    c.bench_function("cookies", |b| {
        b.iter(|| {
            let mut request = HttpRequest::new();
            request.set_header("Cookie", "sid=8f14e45f; theme=dark; lang=en");
            request.cookie(black_box("theme")).map(str::to_owned)
        })
    });
}

criterion_group!(benches, bench_request_line, bench_headers, bench_cookies);
criterion_main!(benches);
