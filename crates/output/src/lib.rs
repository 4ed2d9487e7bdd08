// Copyright 2025-2026 CEMAXECUTER LLC

pub mod net;
pub mod network_iq;
pub mod packetizer;
