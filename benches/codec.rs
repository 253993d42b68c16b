/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use criterion::{criterion_group, criterion_main, Criterion};
use m2handler::request::{MethodPolicy, RequestRegistry};
use m2handler::tnetstring::{self, Value};
use m2handler::websocket;
use std::hint::black_box;

const HEADERS: &str = r#"{"PATH":"/a_handler","host":"localhost:8080","user-agent":"curl/8.0","accept":"*/*","x-forwarded-for":"127.0.0.1","METHOD":"GET","VERSION":"HTTP/1.1","URI":"/a_handler?x=1","QUERY":"x=1","PATTERN":"/a_handler"}"#;

fn request_message(body: &[u8]) -> Vec<u8> {
    let headers: serde_json::Value = serde_json::from_str(HEADERS).unwrap();

    let mut out = b"BD17D85C-4730-4BF2-999D-9D2B2E0FCCF9 8 /a_handler ".to_vec();
    out.extend(Value::from_json(&headers).to_bytes());
    out.extend(tnetstring::encode(body));

    out
}

fn criterion_benchmark(c: &mut Criterion) {
    {
        let headers: serde_json::Value = serde_json::from_str(HEADERS).unwrap();
        let encoded = Value::from_json(&headers).to_bytes();

        c.bench_function("tnetstring decode map", |b| {
            b.iter(|| tnetstring::decode(black_box(&encoded)).unwrap())
        });

        let v = Value::from_json(&headers);

        c.bench_function("tnetstring encode map", |b| {
            b.iter(|| black_box(&v).to_bytes())
        });
    }

    {
        let registry = RequestRegistry::new();
        let msg = request_message(b"");

        c.bench_function("parse http request", |b| {
            b.iter(|| {
                registry
                    .parse(black_box(&msg), MethodPolicy::Strict)
                    .unwrap()
            })
        });
    }

    for size in [16, 1024, 70000] {
        let payload = vec![b'x'; size];

        c.bench_function(&format!("websocket encode frame {size}"), |b| {
            b.iter(|| websocket::encode_frame(0x82, black_box(&payload)))
        });

        let frame = websocket::encode_frame(0x82, &payload);

        c.bench_function(&format!("websocket decode frame {size}"), |b| {
            b.iter(|| websocket::decode_frame(black_box(&frame)).unwrap())
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
