//! Serial port (COM1 UART 16550) sink.

use spin::Mutex;
use x86_64::instructions::port::Port;

/// COM1 base port address
const COM1_PORT: u16 = 0x3F8;

struct Uart {
    initialized: bool,
}

impl Uart {
    /// Initialize the serial port (115200 baud, 8N1)
    fn init(&mut self) {
        unsafe {
            Port::<u8>::new(COM1_PORT + 1).write(0x00); // Disable all interrupts
            Port::<u8>::new(COM1_PORT + 3).write(0x80); // Enable DLAB
            Port::<u8>::new(COM1_PORT).write(0x01); // Divisor low byte (115200)
            Port::<u8>::new(COM1_PORT + 1).write(0x00); // Divisor high byte
            Port::<u8>::new(COM1_PORT + 3).write(0x03); // 8N1, clear DLAB
            Port::<u8>::new(COM1_PORT + 2).write(0xC7); // FIFO, 14-byte threshold
            Port::<u8>::new(COM1_PORT + 4).write(0x0B); // RTS/DSR, OUT2
        }
        self.initialized = true;
    }

    fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }
        let mut status = Port::<u8>::new(COM1_PORT + 5);
        // Wait for transmit buffer to be empty
        while unsafe { status.read() } & 0x20 == 0 {
            core::hint::spin_loop();
        }
        unsafe { Port::<u8>::new(COM1_PORT).write(byte) };
    }
}

/// Polled COM1 output.
pub struct SerialSink {
    uart: Mutex<Uart>,
}

impl SerialSink {
    pub const fn new() -> Self {
        Self {
            uart: Mutex::new(Uart { initialized: false }),
        }
    }

    pub fn init(&self) {
        self.uart.lock().init();
    }
}

impl Default for SerialSink {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::Sink for SerialSink {
    fn write_str(&self, s: &str) {
        // Interrupt handlers log too; masking keeps them off a held lock.
        x86_64::instructions::interrupts::without_interrupts(|| {
            let uart = self.uart.lock();
            for byte in s.bytes() {
                uart.write_byte(byte);
            }
        });
    }
}
