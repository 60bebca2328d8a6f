/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Generated wire types for the Function Proxy control/data plane.

pub mod proto {
    pub mod functionproxy {
        tonic::include_proto!("functionproxy");
    }
}
