// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

mod cli;
mod plan;
