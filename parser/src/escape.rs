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

//! URL percent-decoding

/// Decodes `%HH` escapes (hex digits in either case) to their byte value.
/// When `space_as_plus` is set, `+` decodes to a space, as in query strings
/// and `application/x-www-form-urlencoded` bodies. Any other byte, and any
/// `%` not followed by two hex digits, passes through unchanged.
pub fn url_decode(input: &str, space_as_plus: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if space_as_plus => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hi = (bytes[i + 1] as char).to_digit(16).unwrap_or(0) as u8;
                let lo = (bytes[i + 2] as char).to_digit(16).unwrap_or(0) as u8;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod test {
    use super::url_decode;

    #[test]
    fn percent_escapes_decode_to_bytes() {
        assert_eq!("a b", url_decode("a%20b", false));
        assert_eq!("/path/x", url_decode("%2Fpath%2Fx", false));
    }

    #[test]
    fn hex_digits_decode_case_insensitively() {
        assert_eq!("//", url_decode("%2f%2F", false));
    }

    #[test]
    fn plus_decodes_to_space_only_in_form_mode() {
        assert_eq!("a b", url_decode("a+b", true));
        assert_eq!("a+b", url_decode("a+b", false));
    }

    #[test]
    fn truncated_or_invalid_escapes_pass_through() {
        assert_eq!("100%", url_decode("100%", false));
        assert_eq!("%2", url_decode("%2", false));
        assert_eq!("%zz", url_decode("%zz", false));
    }

    #[test]
    fn plain_text_is_identity() {
        assert_eq!("hello", url_decode("hello", true));
        assert_eq!("", url_decode("", true));
    }
}
