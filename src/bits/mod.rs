// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-level layouts of the structures exchanged with the controller.
//! Everything in here crosses the hardware boundary and must match the
//! xHCI specification bit-for-bit.

pub mod ring_data;
