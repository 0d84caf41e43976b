// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

#[cfg(not(any(feature = "stub", feature = "chaos")))]
compile_error! {"must set stub or chaos feature"}

// The chaos backend is layered on top of the stub's register file, so the
// stub is always built.
pub mod stub;

#[cfg(feature = "chaos")]
pub mod chaos;

cfg_if::cfg_if! {
    if #[cfg(feature = "chaos")] {
        pub use chaos::AsicConfig;
        pub type Handle = chaos::Handle;
    } else {
        pub use stub::AsicConfig;
        pub type Handle = stub::StubHandle;
    }
}
