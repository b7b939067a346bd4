//! Drivers and register maps for devices on the board's I2C bus.

pub mod tps6287x;
