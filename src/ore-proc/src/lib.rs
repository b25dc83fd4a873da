// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Internal utility proc-macros.
//!
//! Note: This is separate from the `mz_ore` crate because `proc-macro` crates are only allowed
//! to export procedural macros and nothing else.

use proc_macro::TokenStream;

mod test;

/// Wrapper around the `test` macro.
///
/// The wrapper automatically initializes our logging infrastructure before the
/// test body runs. Without arguments it expands to a plain `#[test]`; with
/// arguments, the arguments name the test attribute to use instead:
///
/// ```ignore
/// #[mz_ore::test]
/// fn sync_test() {}
///
/// #[mz_ore::test(tokio::test(start_paused = true))]
/// async fn async_test() {}
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    test::test_impl(attr, item)
}
