/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Consumers of a run's sample stream.

pub mod buffer;
pub mod display;
pub mod export;

pub use buffer::{BufferHandler, SampleBuffer};
pub use display::DisplayHandler;
pub use export::CsvHandler;
