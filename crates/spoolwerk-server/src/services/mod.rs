// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer that wires the print crate's components together for the
// daemon and for one-shot administration commands.

pub mod data_dir;
pub mod print_services;
