// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

pub mod its;
mod vcpu;

pub use self::its::{
    Its, ItsConfig, ItsCtrl, ItsError, LpiRegistry, Msi, MsiDelivery, ProtocolError,
    Redistributor,
};
pub use self::vcpu::VcpuList;
