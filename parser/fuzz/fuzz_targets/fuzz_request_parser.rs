#![no_main]

use libfuzzer_sys::fuzz_target;
use rill_parser::{parse_header_line, parse_request_line, HttpRequest};

fuzz_target!(|data: &[u8]| {
    let mut request = HttpRequest::new();
    let mut lines = data.split(|&b| b == b'\n');
    if let Some(line) = lines.next() {
        let _ = parse_request_line(line, &mut request);
    }
    for line in lines {
        parse_header_line(line, &mut request);
    }
    // Drive the lazy decode paths over whatever survived parsing.
    let _ = request.params().len();
    let _ = request.cookies().len();
});
