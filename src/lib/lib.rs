// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod bootstrap;
pub mod codec;
pub mod link;
pub mod migrate;
pub mod progress;
pub mod ring;
pub mod server;
pub mod zfs;
