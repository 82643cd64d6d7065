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

#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(test(attr(deny(warnings))))]

//! HTTP/1.x request and response types, together with the line-level parsing
//! primitives the streaming codec in the server crate is built from.
//!
//! The crate is deliberately free of runtime dependencies: everything here
//! operates on byte slices and owned strings, so it can be unit tested and
//! benchmarked in isolation from any I/O.

mod escape;
mod method;
mod params;
mod request;
mod response;
mod status;
mod version;

pub use escape::url_decode;
pub use method::Method;
pub use params::ParamMap;
pub use request::{parse_header_line, parse_request_line, HttpRequest, ParseError};
pub use response::HttpResponse;
pub use status::StatusCode;
pub use version::Version;
