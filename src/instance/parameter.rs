//! Parameter store: typed, atomic, access-controlled instance parameters.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Which kind of caller is permitted to read/write a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterAccessGroup {
    /// Anyone may access the parameter.
    Public,
    /// Only the owning instance and its recorded dependents may access it.
    Dependency,
    /// Only the owning instance itself may access it.
    Private,
}

/// The declared type of a parameter cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

/// A type-erased parameter value, used at the read/write boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl ParameterValue {
    pub fn type_(&self) -> ParameterType {
        match self {
            Self::U8(_) => ParameterType::U8,
            Self::U16(_) => ParameterType::U16,
            Self::U32(_) => ParameterType::U32,
            Self::U64(_) => ParameterType::U64,
            Self::I8(_) => ParameterType::I8,
            Self::I16(_) => ParameterType::I16,
            Self::I32(_) => ParameterType::I32,
            Self::I64(_) => ParameterType::I64,
        }
    }
}

enum AtomicStorage {
    U8(AtomicU8),
    U16(AtomicU16),
    U32(AtomicU32),
    U64(AtomicU64),
    I8(AtomicI8),
    I16(AtomicI16),
    I32(AtomicI32),
    I64(AtomicI64),
}

impl AtomicStorage {
    fn new(value: ParameterValue) -> Self {
        match value {
            ParameterValue::U8(v) => Self::U8(AtomicU8::new(v)),
            ParameterValue::U16(v) => Self::U16(AtomicU16::new(v)),
            ParameterValue::U32(v) => Self::U32(AtomicU32::new(v)),
            ParameterValue::U64(v) => Self::U64(AtomicU64::new(v)),
            ParameterValue::I8(v) => Self::I8(AtomicI8::new(v)),
            ParameterValue::I16(v) => Self::I16(AtomicI16::new(v)),
            ParameterValue::I32(v) => Self::I32(AtomicI32::new(v)),
            ParameterValue::I64(v) => Self::I64(AtomicI64::new(v)),
        }
    }

    fn type_(&self) -> ParameterType {
        match self {
            Self::U8(_) => ParameterType::U8,
            Self::U16(_) => ParameterType::U16,
            Self::U32(_) => ParameterType::U32,
            Self::U64(_) => ParameterType::U64,
            Self::I8(_) => ParameterType::I8,
            Self::I16(_) => ParameterType::I16,
            Self::I32(_) => ParameterType::I32,
            Self::I64(_) => ParameterType::I64,
        }
    }

    fn load(&self) -> ParameterValue {
        match self {
            Self::U8(a) => ParameterValue::U8(a.load(Ordering::SeqCst)),
            Self::U16(a) => ParameterValue::U16(a.load(Ordering::SeqCst)),
            Self::U32(a) => ParameterValue::U32(a.load(Ordering::SeqCst)),
            Self::U64(a) => ParameterValue::U64(a.load(Ordering::SeqCst)),
            Self::I8(a) => ParameterValue::I8(a.load(Ordering::SeqCst)),
            Self::I16(a) => ParameterValue::I16(a.load(Ordering::SeqCst)),
            Self::I32(a) => ParameterValue::I32(a.load(Ordering::SeqCst)),
            Self::I64(a) => ParameterValue::I64(a.load(Ordering::SeqCst)),
        }
    }

    fn store(&self, value: ParameterValue) -> Result<()> {
        match (self, value) {
            (Self::U8(a), ParameterValue::U8(v)) => a.store(v, Ordering::SeqCst),
            (Self::U16(a), ParameterValue::U16(v)) => a.store(v, Ordering::SeqCst),
            (Self::U32(a), ParameterValue::U32(v)) => a.store(v, Ordering::SeqCst),
            (Self::U64(a), ParameterValue::U64(v)) => a.store(v, Ordering::SeqCst),
            (Self::I8(a), ParameterValue::I8(v)) => a.store(v, Ordering::SeqCst),
            (Self::I16(a), ParameterValue::I16(v)) => a.store(v, Ordering::SeqCst),
            (Self::I32(a), ParameterValue::I32(v)) => a.store(v, Ordering::SeqCst),
            (Self::I64(a), ParameterValue::I64(v)) => a.store(v, Ordering::SeqCst),
            (storage, value) => {
                return Err(Error::invalid_parameter_type(format!(
                    "expected {:?}, got {:?}",
                    storage.type_(),
                    value.type_()
                )));
            }
        }
        Ok(())
    }
}

/// Optional user hooks invoked instead of the plain atomic load/store.
pub struct ParameterCallbacks {
    pub getter: Option<Box<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>>,
    pub setter: Option<Box<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>>,
}

impl Default for ParameterCallbacks {
    fn default() -> Self {
        Self {
            getter: None,
            setter: None,
        }
    }
}

/// A single typed, atomic, access-controlled parameter belonging to an
/// instance.
pub struct ParameterCell {
    name: String,
    owner: String,
    storage: AtomicStorage,
    read_group: ParameterAccessGroup,
    write_group: ParameterAccessGroup,
    callbacks: ParameterCallbacks,
}

impl ParameterCell {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        default: ParameterValue,
        read_group: ParameterAccessGroup,
        write_group: ParameterAccessGroup,
        callbacks: ParameterCallbacks,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            storage: AtomicStorage::new(default),
            read_group,
            write_group,
            callbacks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_(&self) -> ParameterType {
        self.storage.type_()
    }

    pub fn read_group(&self) -> ParameterAccessGroup {
        self.read_group
    }

    pub fn write_group(&self) -> ParameterAccessGroup {
        self.write_group
    }

    /// Raw read, bypassing access checks and getter callback. Used
    /// internally once a caller has already been authorized.
    fn load_raw(&self) -> ParameterValue {
        self.storage.load()
    }

    fn store_raw(&self, value: ParameterValue) -> Result<()> {
        self.storage.store(value)
    }

    /// Reads the value, running the getter callback (if any) over the raw
    /// atomic value first. Callers must perform the relevant access check
    /// before calling this.
    pub fn read(&self) -> ParameterValue {
        let raw = self.load_raw();
        match &self.callbacks.getter {
            Some(f) => f(raw),
            None => raw,
        }
    }

    /// Writes the value, running the setter callback (if any) first.
    /// Callers must perform the relevant access check before calling this.
    pub fn write(&self, value: ParameterValue) -> Result<()> {
        let value = match &self.callbacks.setter {
            Some(f) => f(value),
            None => value,
        };
        self.store_raw(value)
    }

    /// `check_read_public`: only permitted when `read_group == Public`.
    pub fn check_read_public(&self) -> Result<()> {
        if self.read_group == ParameterAccessGroup::Public {
            Ok(())
        } else {
            Err(Error::not_permitted(format!(
                "parameter `{}` does not allow public read access",
                self.name
            )))
        }
    }

    /// `check_write_public`: only permitted when `write_group == Public`.
    pub fn check_write_public(&self) -> Result<()> {
        if self.write_group == ParameterAccessGroup::Public {
            Ok(())
        } else {
            Err(Error::not_permitted(format!(
                "parameter `{}` does not allow public write access",
                self.name
            )))
        }
    }

    /// `check_read_dependency`: permitted for `Public` or `Dependency`
    /// groups, and in the latter case only if `caller` is present in the
    /// depended-upon instance's dependency map (checked by the caller,
    /// which passes `is_recorded_dependent`).
    pub fn check_read_dependency(&self, caller: &str, is_recorded_dependent: bool) -> Result<()> {
        match self.read_group {
            ParameterAccessGroup::Public => Ok(()),
            ParameterAccessGroup::Dependency if is_recorded_dependent => Ok(()),
            _ => Err(Error::not_permitted(format!(
                "`{caller}` may not read parameter `{}` with dependency access",
                self.name
            ))),
        }
    }

    /// `check_write_dependency`: as [`Self::check_read_dependency`], for
    /// writes.
    pub fn check_write_dependency(&self, caller: &str, is_recorded_dependent: bool) -> Result<()> {
        match self.write_group {
            ParameterAccessGroup::Public => Ok(()),
            ParameterAccessGroup::Dependency if is_recorded_dependent => Ok(()),
            _ => Err(Error::not_permitted(format!(
                "`{caller}` may not write parameter `{}` with dependency access",
                self.name
            ))),
        }
    }

    /// `check_read_private`: only the owning instance may read.
    pub fn check_read_private(&self, caller: &str) -> Result<()> {
        if caller == self.owner {
            Ok(())
        } else {
            Err(Error::not_permitted(format!(
                "`{caller}` is not the owner of parameter `{}`",
                self.name
            )))
        }
    }

    /// `check_write_private`: only the owning instance may write.
    pub fn check_write_private(&self, caller: &str) -> Result<()> {
        if caller == self.owner {
            Ok(())
        } else {
            Err(Error::not_permitted(format!(
                "`{caller}` is not the owner of parameter `{}`",
                self.name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(read: ParameterAccessGroup, write: ParameterAccessGroup) -> ParameterCell {
        ParameterCell::new(
            "p",
            "owner",
            ParameterValue::U32(0),
            read,
            write,
            ParameterCallbacks::default(),
        )
    }

    #[test]
    fn public_read_allowed_only_for_public_group() {
        let c = cell(ParameterAccessGroup::Public, ParameterAccessGroup::Public);
        assert!(c.check_read_public().is_ok());

        let c = cell(ParameterAccessGroup::Dependency, ParameterAccessGroup::Public);
        assert!(c.check_read_public().is_err());
    }

    #[test]
    fn dependency_read_requires_recorded_dependent() {
        let c = cell(ParameterAccessGroup::Dependency, ParameterAccessGroup::Private);
        assert!(c.check_read_dependency("dep", true).is_ok());
        assert!(c.check_read_dependency("dep", false).is_err());
    }

    #[test]
    fn private_write_requires_owner() {
        let c = cell(ParameterAccessGroup::Public, ParameterAccessGroup::Private);
        assert!(c.check_write_private("owner").is_ok());
        assert!(c.check_write_private("someone_else").is_err());
    }

    #[test]
    fn type_mismatched_write_fails() {
        let c = cell(ParameterAccessGroup::Public, ParameterAccessGroup::Public);
        let err = c.write(ParameterValue::U8(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidParameterType(_)));
    }

    #[test]
    fn round_trip_read_write() {
        let c = cell(ParameterAccessGroup::Public, ParameterAccessGroup::Public);
        c.write(ParameterValue::U32(42)).unwrap();
        assert_eq!(c.read(), ParameterValue::U32(42));
    }
}
