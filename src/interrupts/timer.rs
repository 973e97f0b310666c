use x86_64::instructions::port::Port;

/// PIT channel 0 at 100 Hz: one scheduling quantum per 10 ms tick.
pub const TICK_HZ: u32 = 100;
const PIT_FREQUENCY: u32 = 1193180;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, rate generator.
const PIT_RATE_GENERATOR: u8 = 0x36;

/// Program the PIT and unmask IRQ0. Everything else on both PICs stays
/// masked; the timer is the only hardware interrupt this kernel takes.
pub fn init() {
    let divisor = PIT_FREQUENCY / TICK_HZ;
    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);
    unsafe {
        command.write(PIT_RATE_GENERATOR);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);

        super::idt::PICS.lock().write_masks(0xFE, 0xFF);
    }
    crate::log_info!("PIT programmed for {} Hz preemption.", TICK_HZ);
}
