/// Shared register mapping
///
/// The four Modbus tables, each with its own start address and size, shared
/// between the protocol context serving clients and the application
/// context. Every access goes through a [`MappingGuard`], the scoped
/// critical section returned by [`ModbusMapping::lock`]; the lock is released
/// when the guard drops, on every exit path.
///
/// The lock is exclusive and not reentrant: locking again from the context
/// that already holds the guard deadlocks or fails. Use
/// [`ModbusMapping::try_lock`] where contention must not block.

use std::fmt;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{data_utils, ModbusAddress, ModbusValue};

/// Start address and size of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    #[serde(default)]
    pub start_address: ModbusAddress,
    pub size: u16,
}

impl TableLayout {
    pub const fn new(start_address: ModbusAddress, size: u16) -> Self {
        Self { start_address, size }
    }

    /// Index range for `count` elements from `address`, or a range fault
    fn range(&self, address: ModbusAddress, count: usize) -> ModbusResult<Range<usize>> {
        let start = usize::from(self.start_address);
        let address = usize::from(address);
        let fault = || ModbusError::invalid_address(address as u16, count.min(usize::from(u16::MAX)) as u16);

        if address < start {
            return Err(fault());
        }
        let offset = address - start;
        let end = offset.checked_add(count).ok_or_else(fault)?;
        if end > usize::from(self.size) {
            return Err(fault());
        }
        Ok(offset..end)
    }
}

/// Layout of all four tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingLayout {
    pub coils: TableLayout,
    pub discrete_inputs: TableLayout,
    pub holding_registers: TableLayout,
    pub input_registers: TableLayout,
}

impl Default for MappingLayout {
    fn default() -> Self {
        Self::uniform(0, 100)
    }
}

impl MappingLayout {
    /// Every table starting at `start_address` with `size` elements
    pub const fn uniform(start_address: ModbusAddress, size: u16) -> Self {
        let table = TableLayout::new(start_address, size);
        Self {
            coils: table,
            discrete_inputs: table,
            holding_registers: table,
            input_registers: table,
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        for (table, layout) in self.tables() {
            if usize::from(layout.start_address) + usize::from(layout.size) > usize::from(u16::MAX) + 1 {
                return Err(ModbusError::configuration(format!(
                    "{} table overflows the address space: start {} + size {}",
                    table, layout.start_address, layout.size
                )));
            }
        }
        if self.tables().iter().all(|(_, layout)| layout.size == 0) {
            return Err(ModbusError::configuration("Mapping has no tables"));
        }
        Ok(())
    }

    fn tables(&self) -> [(Table, TableLayout); 4] {
        [
            (Table::Coils, self.coils),
            (Table::DiscreteInputs, self.discrete_inputs),
            (Table::HoldingRegisters, self.holding_registers),
            (Table::InputRegisters, self.input_registers),
        ]
    }
}

/// The four register classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::Coils => "coils",
            Table::DiscreteInputs => "discrete inputs",
            Table::HoldingRegisters => "holding registers",
            Table::InputRegisters => "input registers",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Tables {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

/// Table sizes, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}

/// Register mapping shared by the protocol and application contexts
#[derive(Debug)]
pub struct ModbusMapping {
    layout: MappingLayout,
    tables: Mutex<Tables>,
}

impl ModbusMapping {
    /// Allocate zeroed tables for `layout`
    pub fn new(layout: MappingLayout) -> ModbusResult<Self> {
        layout.validate()?;
        Ok(Self {
            layout,
            tables: Mutex::new(Tables {
                coils: vec![false; usize::from(layout.coils.size)],
                discrete_inputs: vec![false; usize::from(layout.discrete_inputs.size)],
                holding_registers: vec![0; usize::from(layout.holding_registers.size)],
                input_registers: vec![0; usize::from(layout.input_registers.size)],
            }),
        })
    }

    pub fn layout(&self) -> &MappingLayout {
        &self.layout
    }

    /// Enter the critical section, blocking on contention
    pub fn lock(&self) -> ModbusResult<MappingGuard<'_>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| ModbusError::internal("Register mapping lock poisoned"))?;
        Ok(MappingGuard {
            layout: &self.layout,
            tables,
        })
    }

    /// Enter the critical section only if it is free
    pub fn try_lock(&self) -> ModbusResult<Option<MappingGuard<'_>>> {
        match self.tables.try_lock() {
            Ok(tables) => Ok(Some(MappingGuard {
                layout: &self.layout,
                tables,
            })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Poisoned(_)) => Err(ModbusError::internal("Register mapping lock poisoned")),
        }
    }

    /// Run `f` inside the critical section
    pub fn with_lock<R, F>(&self, f: F) -> ModbusResult<R>
    where
        F: FnOnce(&mut MappingGuard<'_>) -> ModbusResult<R>,
    {
        let mut guard = self.lock()?;
        f(&mut guard)
    }

    pub fn get_stats(&self) -> MappingStats {
        MappingStats {
            coils_count: usize::from(self.layout.coils.size),
            discrete_inputs_count: usize::from(self.layout.discrete_inputs.size),
            holding_registers_count: usize::from(self.layout.holding_registers.size),
            input_registers_count: usize::from(self.layout.input_registers.size),
        }
    }
}

fn read_range<T: Copy>(data: &[T], layout: TableLayout, address: ModbusAddress, count: u16) -> ModbusResult<Vec<T>> {
    let range = layout.range(address, usize::from(count))?;
    Ok(data[range].to_vec())
}

fn write_range<T: Copy>(data: &mut [T], layout: TableLayout, address: ModbusAddress, values: &[T]) -> ModbusResult<()> {
    let range = layout.range(address, values.len())?;
    data[range].copy_from_slice(values);
    Ok(())
}

/// Scoped critical section over the mapping
///
/// All getters and setters are bounds-checked against the table layout and
/// fail with `InvalidAddress` instead of touching memory outside a table.
pub struct MappingGuard<'a> {
    layout: &'a MappingLayout,
    tables: MutexGuard<'a, Tables>,
}

impl MappingGuard<'_> {
    pub fn layout(&self) -> &MappingLayout {
        self.layout
    }

    // Coils

    pub fn get_coil(&self, address: ModbusAddress) -> ModbusResult<bool> {
        Ok(read_range(&self.tables.coils, self.layout.coils, address, 1)?[0])
    }

    pub fn get_coils(&self, address: ModbusAddress, count: u16) -> ModbusResult<Vec<bool>> {
        read_range(&self.tables.coils, self.layout.coils, address, count)
    }

    pub fn set_coil(&mut self, address: ModbusAddress, value: bool) -> ModbusResult<()> {
        write_range(&mut self.tables.coils, self.layout.coils, address, &[value])
    }

    pub fn set_coils(&mut self, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        write_range(&mut self.tables.coils, self.layout.coils, address, values)
    }

    // Discrete inputs

    pub fn get_discrete_input(&self, address: ModbusAddress) -> ModbusResult<bool> {
        Ok(read_range(&self.tables.discrete_inputs, self.layout.discrete_inputs, address, 1)?[0])
    }

    pub fn get_discrete_inputs(&self, address: ModbusAddress, count: u16) -> ModbusResult<Vec<bool>> {
        read_range(&self.tables.discrete_inputs, self.layout.discrete_inputs, address, count)
    }

    pub fn set_discrete_input(&mut self, address: ModbusAddress, value: bool) -> ModbusResult<()> {
        write_range(&mut self.tables.discrete_inputs, self.layout.discrete_inputs, address, &[value])
    }

    pub fn set_discrete_inputs(&mut self, address: ModbusAddress, values: &[bool]) -> ModbusResult<()> {
        write_range(&mut self.tables.discrete_inputs, self.layout.discrete_inputs, address, values)
    }

    // Holding registers

    pub fn get_holding_register(&self, address: ModbusAddress) -> ModbusResult<ModbusValue> {
        Ok(read_range(&self.tables.holding_registers, self.layout.holding_registers, address, 1)?[0])
    }

    pub fn get_holding_registers(&self, address: ModbusAddress, count: u16) -> ModbusResult<Vec<ModbusValue>> {
        read_range(&self.tables.holding_registers, self.layout.holding_registers, address, count)
    }

    pub fn set_holding_register(&mut self, address: ModbusAddress, value: ModbusValue) -> ModbusResult<()> {
        write_range(&mut self.tables.holding_registers, self.layout.holding_registers, address, &[value])
    }

    pub fn set_holding_registers(&mut self, address: ModbusAddress, values: &[ModbusValue]) -> ModbusResult<()> {
        write_range(&mut self.tables.holding_registers, self.layout.holding_registers, address, values)
    }

    // Input registers

    pub fn get_input_register(&self, address: ModbusAddress) -> ModbusResult<ModbusValue> {
        Ok(read_range(&self.tables.input_registers, self.layout.input_registers, address, 1)?[0])
    }

    pub fn get_input_registers(&self, address: ModbusAddress, count: u16) -> ModbusResult<Vec<ModbusValue>> {
        read_range(&self.tables.input_registers, self.layout.input_registers, address, count)
    }

    pub fn set_input_register(&mut self, address: ModbusAddress, value: ModbusValue) -> ModbusResult<()> {
        write_range(&mut self.tables.input_registers, self.layout.input_registers, address, &[value])
    }

    pub fn set_input_registers(&mut self, address: ModbusAddress, values: &[ModbusValue]) -> ModbusResult<()> {
        write_range(&mut self.tables.input_registers, self.layout.input_registers, address, values)
    }

    // Two-register values

    /// Read an IEEE 754 float spread over two holding registers
    pub fn get_holding_f32(&self, address: ModbusAddress) -> ModbusResult<f32> {
        data_utils::registers_to_f32(&self.get_holding_registers(address, 2)?)
    }

    /// Publish an IEEE 754 float into two input registers
    pub fn set_input_f32(&mut self, address: ModbusAddress, value: f32) -> ModbusResult<()> {
        self.set_input_registers(address, &data_utils::f32_to_registers(value))
    }
}

impl fmt::Debug for MappingGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingGuard").field("layout", self.layout).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ModbusMapping {
        ModbusMapping::new(MappingLayout {
            coils: TableLayout::new(0, 16),
            discrete_inputs: TableLayout::new(100, 8),
            holding_registers: TableLayout::new(0, 10),
            input_registers: TableLayout::new(30000, 4),
        })
        .unwrap()
    }

    #[test]
    fn test_coil_operations() {
        let mapping = mapping();
        let mut guard = mapping.lock().unwrap();

        guard.set_coil(3, true).unwrap();
        assert!(guard.get_coil(3).unwrap());
        guard.set_coils(8, &[true, false, true]).unwrap();
        assert_eq!(guard.get_coils(8, 3).unwrap(), vec![true, false, true]);
        assert!(guard.set_coils(15, &[true, true]).is_err());
    }

    #[test]
    fn test_register_bounds() {
        let mapping = mapping();
        let mut guard = mapping.lock().unwrap();

        guard.set_holding_register(9, 0xBEEF).unwrap();
        assert_eq!(guard.get_holding_register(9).unwrap(), 0xBEEF);
        assert_eq!(
            guard.set_holding_register(10, 1),
            Err(ModbusError::invalid_address(10, 1))
        );
        assert!(guard.get_holding_registers(8, 3).is_err());
        assert_eq!(guard.get_holding_registers(10, 0).unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn test_start_address_offsets() {
        let mapping = mapping();
        let mut guard = mapping.lock().unwrap();

        assert!(guard.get_discrete_input(99).is_err());
        guard.set_discrete_inputs(100, &[true; 8]).unwrap();
        assert!(guard.get_discrete_input(107).unwrap());
        assert!(guard.get_discrete_input(108).is_err());

        guard.set_input_register(30003, 7).unwrap();
        assert_eq!(guard.get_input_registers(30002, 2).unwrap(), vec![0, 7]);
        assert!(guard.get_input_register(0).is_err());
    }

    #[test]
    fn test_float_helpers() {
        let mapping = mapping();
        let mut guard = mapping.lock().unwrap();

        guard.set_input_f32(30000, 23.25).unwrap();
        let registers = guard.get_input_registers(30000, 2).unwrap();
        assert_eq!(data_utils::registers_to_f32(&registers).unwrap(), 23.25);

        guard.set_holding_registers(0, &data_utils::f32_to_registers(-1.5)).unwrap();
        assert_eq!(guard.get_holding_f32(0).unwrap(), -1.5);
    }

    #[test]
    fn test_critical_section_is_exclusive() {
        let mapping = mapping();
        let guard = mapping.lock().unwrap();
        assert!(mapping.try_lock().unwrap().is_none());
        drop(guard);
        assert!(mapping.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let mapping = mapping();
        let result: ModbusResult<()> = mapping.with_lock(|guard| {
            guard.set_holding_register(0, 1)?;
            guard.set_holding_register(50, 2)?;
            Ok(())
        });
        assert!(result.is_err());

        let guard = mapping.try_lock().unwrap().unwrap();
        assert_eq!(guard.get_holding_register(0).unwrap(), 1);
    }

    #[test]
    fn test_layout_validation() {
        assert!(ModbusMapping::new(MappingLayout::uniform(0, 0)).is_err());

        let mut layout = MappingLayout::default();
        layout.holding_registers = TableLayout::new(65500, 100);
        assert!(matches!(layout.validate(), Err(ModbusError::Configuration { .. })));

        let mut layout = MappingLayout::default();
        layout.holding_registers = TableLayout::new(65436, 100);
        assert!(layout.validate().is_ok());
    }
}
