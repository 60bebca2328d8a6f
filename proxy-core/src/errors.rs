/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Boundary error taxonomy (`spec.md` §6/§7).

use api::proto::functionproxy::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("duplicate request")]
    InstanceDuplicated,
    #[error("instance already exited")]
    InstanceExited,
    #[error("instance already evicted")]
    InstanceEvicted,
    #[error("instance is sub-health")]
    InstanceSubHealth,
    #[error("resource not enough: {0}")]
    ResourceNotEnough(String),
    #[error("user function exception: {0}")]
    UserFunctionException(String),
    #[error("runtime bus error: {0}")]
    RequestBetweenRuntimeBus(String),
    #[error("inner communication error: {0}")]
    InnerCommunication(String),
    #[error("inner system error: {0}")]
    InnerSystemError(String),
    #[error("metadata store operation failed: {0}")]
    MetaStoreOperation(String),
    #[error("illegal state transition")]
    StateMachineError,
    #[error("schedule canceled")]
    ScheduleCanceled,
    #[error("create rate limited")]
    CreateRateLimit,
    #[error("function meta not found: {0}")]
    FunctionMetaNotFound(String),
    #[error("subscription state invalid")]
    SubStateInvalid,
    #[error("group exit together")]
    GroupExitTogether,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ParamInvalid(_) => ErrorCode::ErrParamInvalid,
            Self::InstanceNotFound(_) => ErrorCode::ErrInstanceNotFound,
            Self::InstanceDuplicated => ErrorCode::ErrInstanceDuplicated,
            Self::InstanceExited => ErrorCode::ErrInstanceExited,
            Self::InstanceEvicted => ErrorCode::ErrInstanceEvicted,
            Self::InstanceSubHealth => ErrorCode::ErrInstanceSubHealth,
            Self::ResourceNotEnough(_) => ErrorCode::ErrResourceNotEnough,
            Self::UserFunctionException(_) => ErrorCode::ErrUserFunctionException,
            Self::RequestBetweenRuntimeBus(_) => ErrorCode::ErrRequestBetweenRuntimeBus,
            Self::InnerCommunication(_) => ErrorCode::ErrInnerCommunication,
            Self::InnerSystemError(_) => ErrorCode::ErrInnerSystemError,
            Self::MetaStoreOperation(_) => ErrorCode::ErrEtcdOperationError,
            Self::StateMachineError => ErrorCode::ErrStateMachineError,
            Self::ScheduleCanceled => ErrorCode::ErrScheduleCanceled,
            Self::CreateRateLimit => ErrorCode::ErrCreateRateLimit,
            Self::FunctionMetaNotFound(_) => ErrorCode::ErrFunctionMetaNotFound,
            Self::SubStateInvalid => ErrorCode::ErrSubStateInvalid,
            Self::GroupExitTogether => ErrorCode::ErrGroupExitTogether,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
