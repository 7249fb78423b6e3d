// Low-level driver routines for the qemu "virt" board's 16550a UART.
// Register layout is an external MMIO contract; the buffering and
// sleep/wakeup glue around it is this module's own responsibility.

use crate::memlayout::UART0;
use crate::proc::wakeup;
use crate::spinlock::Spinlock;

macro_rules! Reg {
    ( $reg:expr ) => {
        (UART0 + $reg) as *mut u8
    };
}

macro_rules! ReadReg {
    ( $reg:expr ) => {
        core::ptr::read_volatile(Reg!($reg))
    };
}

macro_rules! WriteReg {
    ( $reg:expr, $v:expr ) => {
        core::ptr::write_volatile(Reg!($reg), $v)
    };
}

// the UART control registers are memory-mapped at address UART0.
// this macro returns the address of one of the registers.
const RHR: usize = 0; // receive holding register (for input bytes)
const THR: usize = 0; // transmit holding register (for output bytes)
const IER: usize = 1; // interrupt enable register
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR: usize = 2; // FIFO control register
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const ISR: usize = 2; // interrupt status register
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3 << 0;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR: usize = 5; // line status register
const LSR_RX_READY: u8 = 1 << 0; // input is waiting to be read from RHR
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

const UART_TX_BUF_SIZE: usize = 32;

pub static mut UART_INSTANCE: Uart = Uart::create();

pub struct Uart {
    uart_tx_lock: Spinlock,
    // output buffer, a circular ring.
    uart_tx_buf: [u8; UART_TX_BUF_SIZE],
    uart_tx_w: usize, // write next to uart_tx_buf[uart_tx_w % UART_TX_BUF_SIZE]
    uart_tx_r: usize, // read next from uart_tx_buf[uart_tx_r % UART_TX_BUF_SIZE]
}

impl Uart {
    pub const fn create() -> Self {
        Self {
            uart_tx_lock: Spinlock::init_lock("uart"),
            uart_tx_buf: [0; UART_TX_BUF_SIZE],
            uart_tx_w: 0,
            uart_tx_r: 0,
        }
    }

    pub fn init(self: &mut Self) {
        unsafe {
            // disable interrupts.
            WriteReg!(IER, 0x00);

            // special mode to set baud rate.
            WriteReg!(LCR, LCR_BAUD_LATCH);

            // LSB for baud rate of 38.4K.
            WriteReg!(0, 0x03);

            // MSB for baud rate of 38.4K.
            WriteReg!(1, 0x00);

            // leave set-baud mode,
            // and set word length to 8 bits, no parity.
            WriteReg!(LCR, LCR_EIGHT_BITS);

            // reset and enable FIFOs.
            WriteReg!(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

            // enable transmit and receive interrupts.
            WriteReg!(IER, IER_TX_ENABLE | IER_RX_ENABLE);
        }
    }

    // add a character to the output buffer and tell the
    // UART to start sending if it isn't already.
    // blocks if the output buffer is full, because it is
    // pretty trashy to lose output characters, but an
    // okay choice given that we have a small, fixed-size
    // set of output buffers.
    pub fn putc(self: &mut Self, c: u8) {
        self.uart_tx_lock.acquire();

        loop {
            if self.uart_tx_w == self.uart_tx_r + UART_TX_BUF_SIZE {
                // buffer is full.
                // wait for uartstart() to open up space in the buffer.
                crate::proc::sleep(&self.uart_tx_r as *const usize, &mut self.uart_tx_lock);
            } else {
                break;
            }
        }

        self.uart_tx_buf[self.uart_tx_w % UART_TX_BUF_SIZE] = c;
        self.uart_tx_w += 1;
        self.start();
        self.uart_tx_lock.release();
    }

    // alternate version of putc() that doesn't
    // use interrupts, for use by kernel printf() and
    // to echo characters. it spins waiting for the uart's
    // output register to be empty.
    pub fn putc_sync(self: &mut Self, c: u8) {
        crate::spinlock::push_off(); // avoid a race with an interrupt.

        unsafe {
            if (ReadReg!(LSR) & LSR_TX_IDLE) == 0 {
                // uart is ready only when LSR_TX_IDLE is set.
            }
            while (ReadReg!(LSR) & LSR_TX_IDLE) == 0 {}
            WriteReg!(THR, c);
        }

        crate::spinlock::pop_off();
    }

    // if the UART is idle, and a character is waiting
    // in the transmit buffer, send it.
    // caller must hold uart_tx_lock.
    // called from both the top- and bottom-half.
    fn start(self: &mut Self) {
        loop {
            if self.uart_tx_w == self.uart_tx_r {
                // transmit buffer is empty.
                unsafe {
                    ReadReg!(ISR);
                }
                return;
            }

            unsafe {
                if (ReadReg!(LSR) & LSR_TX_IDLE) == 0 {
                    // the UART transmit holding register is full,
                    // so we cannot give it another byte.
                    // it will interrupt when it's ready for a new byte.
                    return;
                }
            }

            let c = self.uart_tx_buf[self.uart_tx_r % UART_TX_BUF_SIZE];
            self.uart_tx_r += 1;

            // maybe uartputc() is waiting for space in the buffer.
            wakeup(&self.uart_tx_r as *const usize);

            unsafe {
                WriteReg!(THR, c);
            }
        }
    }

    // read one input character from the UART.
    // return -1 if none is waiting.
    fn getc(self: &mut Self) -> i32 {
        unsafe {
            if (ReadReg!(LSR) & LSR_RX_READY) != 0 {
                // input data is ready.
                ReadReg!(RHR) as i32
            } else {
                -1
            }
        }
    }

    // handle a uart interrupt, raised because input has
    // arrived, or the uart is ready for more output, or
    // both. called from devintr().
    pub fn intr(self: &mut Self) {
        // read and process incoming characters.
        loop {
            let c = self.getc();
            if c == -1 {
                break;
            }
            unsafe {
                crate::console::CONSOLE_INSTANCE.consoleintr(c as u8);
            }
        }

        // send buffered characters.
        self.uart_tx_lock.acquire();
        self.start();
        self.uart_tx_lock.release();
    }
}

pub fn uartinit() {
    unsafe {
        UART_INSTANCE.init();
    }
}
