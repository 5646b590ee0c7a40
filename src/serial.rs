// src/serial.rs

//! Serial console driver (NS16550A) for kernel output
//!
//! Provides UART communication on the qemu virt machine's NS16550A with:
//! - 38400 baud rate
//! - 8 data bits, no parity, 1 stop bit (8N1)
//! - FIFO buffer support
//! - Transmit-ready polling
//!
//! On non-riscv64 targets (hosted test builds) the output sink is a stub
//! and everything written here disappears.

use core::fmt::{self, Write};

#[cfg(target_arch = "riscv64")]
mod hw {
    use spin::Mutex;

    use crate::kernel::core::traits::{CharDevice, Device};
    use crate::kernel::core::KernelResult;
    use crate::kernel::mm::memlayout::UART0;

    /// Register offsets from the MMIO base
    mod register_offset {
        pub const DATA: usize = 0; // RBR/THR (DLAB=0)
        pub const INTERRUPT_ENABLE: usize = 1; // IER (DLAB=0)
        pub const FIFO_CONTROL: usize = 2; // FCR
        pub const LINE_CONTROL: usize = 3; // LCR
        pub const LINE_STATUS: usize = 5; // LSR
    }

    /// Line Control Register (LCR) bit masks
    mod line_control {
        /// Enable DLAB (Divisor Latch Access Bit)
        pub const DLAB_ENABLE: u8 = 0x80;
        /// 8 bits, no parity, 1 stop bit (8N1)
        pub const CONFIG_8N1: u8 = 0x03;
    }

    /// Line Status Register (LSR) bit masks
    mod line_status {
        /// Receive data ready
        pub const DATA_READY: u8 = 0x01;
        /// Transmit holding register empty
        pub const TRANSMIT_EMPTY: u8 = 0x20;
    }

    /// FIFO Control Register configuration
    mod fifo_control {
        /// Enable FIFOs and clear them
        pub const ENABLE_AND_CLEAR: u8 = 0x07;
    }

    /// Baud rate divisor for 38400 baud (1.8432 MHz / (16 * 38400))
    const BAUD_RATE_DIVISOR: u16 = 3;

    /// The NS16550A UART behind the fixed MMIO window.
    pub struct Ns16550 {
        base: usize,
    }

    impl Ns16550 {
        pub const fn new(base: usize) -> Self {
            Self { base }
        }

        fn read_reg(&self, offset: usize) -> u8 {
            // SAFETY: the UART MMIO window is device memory mapped at a
            // fixed, valid address on this machine.
            unsafe { ((self.base + offset) as *const u8).read_volatile() }
        }

        fn write_reg(&mut self, offset: usize, value: u8) {
            // SAFETY: as in `read_reg`.
            unsafe { ((self.base + offset) as *mut u8).write_volatile(value) }
        }
    }

    impl Device for Ns16550 {
        fn name(&self) -> &str {
            "ns16550a"
        }

        fn init(&mut self) -> KernelResult<()> {
            // No interrupts; the kernel polls.
            self.write_reg(register_offset::INTERRUPT_ENABLE, 0x00);
            // Program the divisor latch.
            self.write_reg(register_offset::LINE_CONTROL, line_control::DLAB_ENABLE);
            self.write_reg(register_offset::DATA, (BAUD_RATE_DIVISOR & 0xff) as u8);
            self.write_reg(
                register_offset::INTERRUPT_ENABLE,
                (BAUD_RATE_DIVISOR >> 8) as u8,
            );
            // 8N1, DLAB off.
            self.write_reg(register_offset::LINE_CONTROL, line_control::CONFIG_8N1);
            self.write_reg(
                register_offset::FIFO_CONTROL,
                fifo_control::ENABLE_AND_CLEAR,
            );
            Ok(())
        }
    }

    impl CharDevice for Ns16550 {
        fn read_byte(&self) -> KernelResult<Option<u8>> {
            if self.read_reg(register_offset::LINE_STATUS) & line_status::DATA_READY == 0 {
                return Ok(None);
            }
            Ok(Some(self.read_reg(register_offset::DATA)))
        }

        fn write_byte(&mut self, byte: u8) -> KernelResult<()> {
            while self.read_reg(register_offset::LINE_STATUS) & line_status::TRANSMIT_EMPTY == 0 {
                core::hint::spin_loop();
            }
            self.write_reg(register_offset::DATA, byte);
            Ok(())
        }
    }

    /// The console UART.
    pub static SERIAL: Mutex<Ns16550> = Mutex::new(Ns16550::new(UART0));
}

#[cfg(target_arch = "riscv64")]
pub use self::hw::SERIAL;

/// Initialize the serial console. Must run before the first output macro.
pub fn init() {
    #[cfg(target_arch = "riscv64")]
    {
        use crate::kernel::core::traits::Device;
        let _ = SERIAL.lock().init();
    }
}

/// Write raw bytes to the console.
pub fn write_bytes(bytes: &[u8]) {
    #[cfg(target_arch = "riscv64")]
    {
        use crate::kernel::core::traits::CharDevice;
        let mut serial = SERIAL.lock();
        let _ = serial.write_bytes(bytes);
    }
    #[cfg(not(target_arch = "riscv64"))]
    let _ = bytes;
}

fn write_str(s: &str) {
    write_bytes(s.as_bytes());
}

/// Adapter so Rust's formatting machinery can target the serial port.
pub struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str(s);
        Ok(())
    }
}

/// Write formatted data to the serial port (used by the logging macros)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let mut writer = SerialWriter;
    let _ = writer.write_fmt(args);
}

/// Serial print macro
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ({
        $crate::serial::_print(format_args!($($arg)*));
    });
}

/// Serial println macro
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}
