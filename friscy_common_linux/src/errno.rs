// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error handling. See [`Errno`].

use thiserror::Error;

/// Linux error numbers
///
/// A transparent wrapper around the positive Linux error number, with explicit
/// conversions to the negated form syscall results carry.
#[derive(PartialEq, Eq, Clone, Copy, Error)]
pub struct Errno {
    value: core::num::NonZeroU8,
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({} = {})", self.value.get(), self.name())
    }
}

impl Errno {
    const fn from_const(v: u8) -> Self {
        Self {
            value: match core::num::NonZeroU8::new(v) {
                Some(v) => v,
                None => panic!("errno constants are nonzero"),
            },
        }
    }

    /// The negated value placed in `a0` as a syscall result.
    pub fn as_neg(self) -> i64 {
        -i64::from(self.value.get())
    }

    /// Build from a negative host `errno` (e.g. `-errno` out of libc wrappers).
    /// Out-of-range values collapse to `EINVAL`.
    pub fn from_host_neg(value: i64) -> Self {
        u8::try_from(-value)
            .ok()
            .and_then(core::num::NonZeroU8::new)
            .map_or(Errno::EINVAL, |value| Self { value })
    }

    pub const EPERM: Self = Self::from_const(1);
    pub const ENOENT: Self = Self::from_const(2);
    pub const ESRCH: Self = Self::from_const(3);
    pub const ENOEXEC: Self = Self::from_const(8);
    pub const EBADF: Self = Self::from_const(9);
    pub const ECHILD: Self = Self::from_const(10);
    pub const EAGAIN: Self = Self::from_const(11);
    pub const ENOMEM: Self = Self::from_const(12);
    pub const EACCES: Self = Self::from_const(13);
    pub const EFAULT: Self = Self::from_const(14);
    pub const EBUSY: Self = Self::from_const(16);
    pub const EEXIST: Self = Self::from_const(17);
    pub const ENOTDIR: Self = Self::from_const(20);
    pub const EISDIR: Self = Self::from_const(21);
    pub const EINVAL: Self = Self::from_const(22);
    pub const ENOTTY: Self = Self::from_const(25);
    pub const EMLINK: Self = Self::from_const(31);
    pub const ERANGE: Self = Self::from_const(34);
    pub const ENOSYS: Self = Self::from_const(38);
    pub const ENOTEMPTY: Self = Self::from_const(39);
    pub const EOVERFLOW: Self = Self::from_const(75);
    pub const ENOTSOCK: Self = Self::from_const(88);
    pub const EPROTOTYPE: Self = Self::from_const(91);
    pub const ENOPROTOOPT: Self = Self::from_const(92);
    pub const ENOTSUP: Self = Self::from_const(95);
    pub const EAFNOSUPPORT: Self = Self::from_const(97);
    pub const EISCONN: Self = Self::from_const(106);
    pub const ENOTCONN: Self = Self::from_const(107);
    pub const ETIMEDOUT: Self = Self::from_const(110);

    fn name(self) -> &'static str {
        match self.value.get() {
            1 => "EPERM",
            2 => "ENOENT",
            3 => "ESRCH",
            8 => "ENOEXEC",
            9 => "EBADF",
            10 => "ECHILD",
            11 => "EAGAIN",
            12 => "ENOMEM",
            13 => "EACCES",
            14 => "EFAULT",
            16 => "EBUSY",
            17 => "EEXIST",
            20 => "ENOTDIR",
            21 => "EISDIR",
            22 => "EINVAL",
            25 => "ENOTTY",
            31 => "EMLINK",
            34 => "ERANGE",
            38 => "ENOSYS",
            39 => "ENOTEMPTY",
            75 => "EOVERFLOW",
            88 => "ENOTSOCK",
            91 => "EPROTOTYPE",
            92 => "ENOPROTOOPT",
            95 => "ENOTSUP",
            97 => "EAFNOSUPPORT",
            106 => "EISCONN",
            107 => "ENOTCONN",
            110 => "ETIMEDOUT",
            _ => "E?",
        }
    }
}

impl From<friscy::fs::FsError> for Errno {
    fn from(value: friscy::fs::FsError) -> Self {
        use friscy::fs::FsError;
        match value {
            FsError::NotFound => Errno::ENOENT,
            FsError::NotADirectory => Errno::ENOTDIR,
            FsError::IsADirectory => Errno::EISDIR,
            FsError::AlreadyExists => Errno::EEXIST,
            FsError::BadFd => Errno::EBADF,
            FsError::InvalidArgument => Errno::EINVAL,
            FsError::NotEmpty => Errno::ENOTEMPTY,
            FsError::TooManyLinks => Errno::EMLINK,
            FsError::Busy => Errno::EBUSY,
        }
    }
}

impl From<friscy::machine::MachineError> for Errno {
    fn from(_: friscy::machine::MachineError) -> Self {
        // Guest pointers that fault mid-syscall surface as EFAULT, as on Linux.
        Errno::EFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::Errno;

    #[test]
    fn negation_and_display() {
        assert_eq!(Errno::ENOENT.as_neg(), -2);
        assert_eq!(format!("{}", Errno::ENOSYS), "ENOSYS");
        assert_eq!(format!("{:?}", Errno::EBADF), "Errno(9 = EBADF)");
    }

    #[test]
    fn from_host() {
        assert_eq!(Errno::from_host_neg(-9), Errno::EBADF);
        assert_eq!(Errno::from_host_neg(-9999), Errno::EINVAL);
    }
}
