// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno::*, Error},
    geometry::{BlockId, BLOCK_SIZE},
    os::{Arc, Mutex},
    return_errno, return_errno_with_msg,
    util::{align_down, align_up},
};

pub(crate) type Result<T> = std::result::Result<T, Error>;

pub(crate) use std::fmt::{self, Debug};

pub(crate) use log::{debug, error, info, trace, warn};
