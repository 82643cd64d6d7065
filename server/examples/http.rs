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

//! Minimal HTTP server with a couple of routes.

use std::io::Result;
use std::sync::Arc;

use rill::{EventLoop, HttpServer};
use rill_parser::StatusCode;

fn main() -> Result<()> {
    let loop_ = EventLoop::new()?;
    let addr = "0.0.0.0:8000".parse().expect("listen address");
    let server = HttpServer::new(&loop_, &addr, "HelloHttp", false)?;

    server.set_http_callback(Arc::new(|request, response| {
        let path = request.path().to_owned();
        match path.as_str() {
            "/" => {
                response.set_status(StatusCode::Ok);
                response.set_header("Content-Type", "text/plain");
                response.set_body("Hello from rill\n");
            }
            "/greet" => {
                let name = request.param("name").unwrap_or("stranger").to_owned();
                response.set_status(StatusCode::Ok);
                response.set_header("Content-Type", "text/plain");
                response.set_body(format!("Hello, {}!\n", name));
            }
            _ => {
                response.set_status(StatusCode::NotFound);
                response.set_body("not found\n");
            }
        }
    }));
    server.set_thread_num(2);
    server.start();

    println!("http server listening on {}", addr);
    loop_.run();
    Ok(())
}
