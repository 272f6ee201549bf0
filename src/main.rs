// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The main vela binary.

use clap::Parser;

use vela::cli::Vela;

fn main() {
    // Don't return Result from main; that prints the debug representation
    // of the error.
    if let Err(e) = Vela::parse().run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
