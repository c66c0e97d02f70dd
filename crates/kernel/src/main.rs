// cSpell:ignore kmain

#![cfg_attr(not(test), no_std)]
#![no_main]

#[cfg(not(test))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {info}");
    vega_kernel::halt()
}
