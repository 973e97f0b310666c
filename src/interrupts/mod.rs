pub mod gdt;
pub mod idt;
pub mod timer;
pub mod usermode;

/// Load the GDT/TSS, install the IDT, and remap the PICs. Interrupts
/// stay disabled; the boot path enables them once the scheduler is live.
pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}
