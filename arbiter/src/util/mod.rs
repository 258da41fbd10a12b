// SPDX-License-Identifier: Apache-2.0

pub mod duration;
pub mod http;
