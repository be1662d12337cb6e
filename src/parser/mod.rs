// Copyright 2022 Ryan Seipp
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

//! Parser implementations for HTTP/1.x

pub mod h1;
pub mod method;
mod raw_request;
pub mod status;
pub mod version;

pub use method::Method;
pub use version::Version;

/// A single header as a borrowed name/value pair, valid only for the
/// lifetime of the receive buffer it was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'buf> {
    /// Header field name, exactly as received (not lowercased).
    pub name: &'buf [u8],
    /// Header field value, with leading/trailing optional whitespace stripped.
    pub value: &'buf [u8],
}

impl<'buf> Header<'buf> {
    /// Case-insensitive comparison of the header name against `name`.
    pub fn name_eq_ignore_ascii_case(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }

    /// The value interpreted as UTF-8, if valid.
    pub fn value_str(&self) -> Option<&'buf str> {
        std::str::from_utf8(self.value).ok()
    }
}
