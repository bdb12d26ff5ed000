// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

#![forbid(unsafe_code)]

pub mod arch;
pub mod loader;
pub mod machine;
pub mod op;
pub mod program;
pub mod vm;
