use crate::console::Console;

/// A serial port the console logs through.
pub struct SerialWriter {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    port: uart_16550::SerialPort,
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    port: uart_16550::MmioSerialPort,
}

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn init(console: &Console) {
    // SAFETY: COM1 is the standard port address.
    let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
    port.init();
    console.attach_serial(SerialWriter { port });
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn init(console: &Console, address: usize) {
    // SAFETY: The caller provides the platform's UART MMIO base.
    let mut port = unsafe { uart_16550::MmioSerialPort::new(address) };
    port.init();
    console.attach_serial(SerialWriter { port });
}
