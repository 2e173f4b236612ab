//! Domain model for the grip-sensor BLE peripheral simulator.

pub mod control;
pub mod gatt;
pub mod generator;
pub mod mode;
pub mod reading;
pub mod tree;
