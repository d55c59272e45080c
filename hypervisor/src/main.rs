#![doc = include_str!("../README.md")]
#![no_main]
#![no_std]
#![feature(core_intrinsics)]
#![feature(new_uninit)]
#![feature(panic_info_message)]
#![feature(stmt_expr_attributes)]
#![warn(
    // groups: https://doc.rust-lang.org/rustc/lints/groups.html
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    unused,

    // warnings that are not enabled by default or covered by groups
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    noop_method_call,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,

    // https://github.com/rust-lang/rust-clippy/blob/master/README.md
    clippy::pedantic,
    clippy::cargo,

    // https://doc.rust-lang.org/rustdoc/lints.html
    rustdoc::missing_crate_level_docs,
    rustdoc::private_doc_tests,
    rustdoc::invalid_html_tags,
)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

mod allocator;
mod boot_state;
mod cache;
mod config;
mod dispatch;
mod error;
mod exint_pass;
mod hardware_vt;
mod hypervisor;
mod interp;
mod list;
mod logger;
mod mmioclr;
mod npt;
mod paging;
mod panic;
mod sched;
mod spt;
mod status;
mod system_table;
mod vcpu;
mod vmctl;
mod x86_instructions;

use crate::{
    hypervisor::{install_and_run, Monitor},
    logger::init_uart_logger,
    system_table::{init_system_table, system_table},
};
use alloc::boxed::Box;
use core::ffi::c_void;
use log::info;
use system_table::system_table_unsafe;
use uefi::{
    prelude::*,
    proto::{loaded_image::LoadedImage, pi::mp::MpServices},
    table::boot::{OpenProtocolAttributes, OpenProtocolParams},
};
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// Boot-time initializers run in order before the hypervisor installs
/// itself. Mirrors the reference monitor's `call_initfunc` registration
/// table, collapsed to a plain sorted constant slice since this project has
/// no dynamic module loading to register driver callbacks against.
const BOOT_INITFUNCS: &[(&str, fn())] = &[("logger", init_uart_logger), ("banner", print_banner)];

/// Prints the startup banner. Split out from `efi_main` so it can sit in
/// [`BOOT_INITFUNCS`] alongside every other boot-time initializer.
fn print_banner() {
    info!("rhv loaded🔥");
}

/// The entry point of the program.
#[no_mangle]
extern "efiapi" fn efi_main(image: Handle, system_table: SystemTable<Boot>) -> Status {
    for (_name, initfunc) in BOOT_INITFUNCS {
        initfunc();
    }

    init_system_table(system_table, image);
    print_image_info();

    // The monitor state (scheduler, vCPU registry, cross-cutting callback
    // registries) is shared by every logical processor; it outlives
    // `efi_main`'s own stack frame, so it is leaked onto the heap and handed
    // to application processors by raw pointer via `start_hypervisor_on_ap`.
    let monitor = Box::leak(Box::new(Monitor::new()));
    start_hypervisor_on_all_processors(monitor)
}

/// Installs the hypervisor with [`install_and_run`] on every logical
/// processor.
fn start_hypervisor_on_all_processors(monitor: &'static Monitor) -> ! {
    if number_of_logical_processors() == 1 {
        // Safety: this call frame is the outermost one below `efi_main`'s own
        // call to this function, matching `install_and_run`'s requirement
        // that its caller frame stay live.
        unsafe { install_and_run(monitor) }
    } else {
        // Run `start_hypervisor_on_ap` on all application processors.
        // Safety: Code is single threaded.
        let st = unsafe { system_table_unsafe() };
        let bs = st.boot_services();
        let mp = unsafe {
            bs.open_protocol::<MpServices>(
                OpenProtocolParams {
                    handle: bs.get_handle_for_protocol::<MpServices>().unwrap(),
                    agent: bs.image_handle(),
                    controller: None,
                },
                OpenProtocolAttributes::GetProtocol,
            )
        }
        .unwrap();

        // NOTE: We lose the current processor. EFI_MP_SERVICES_STARTUP_ALL_APS
        // (== startup_all_aps) cannot be used in the non-blocking mode at this
        // stage, and `install_and_run` never returns. So, this API never
        // returns either, and the calling processor is stuck at here. We could
        // fix this by sending INIT-SIPI-SIPI manually.
        let procedure_argument = (monitor as *const Monitor).cast_mut().cast::<c_void>();
        mp.startup_all_aps(false, start_hypervisor_on_ap, procedure_argument, None)
            .unwrap();
        panic!("Should not return from startup_all_aps()")
    }
}

/// Wraps the call to [`install_and_run`] for application processors.
extern "efiapi" fn start_hypervisor_on_ap(context: *mut c_void) {
    let monitor = unsafe { context.cast::<Monitor>().as_ref().unwrap() };
    // Safety: this call frame is the outermost one below the MP-services
    // trampoline that invoked it, matching `install_and_run`'s requirement.
    unsafe { install_and_run(monitor) };
}

/// Returns the number of enabled logical processors, as reported by
/// `MpServices`. A uniprocessor system has no `MpServices` protocol at all,
/// in which case there is exactly one.
fn number_of_logical_processors() -> u64 {
    let st = system_table();
    let bs = st.boot_services();
    let Ok(handle) = bs.get_handle_for_protocol::<MpServices>() else {
        return 1;
    };
    // Safety: the protocol and handle remain valid indefinitely.
    let mp = unsafe {
        bs.open_protocol::<MpServices>(
            OpenProtocolParams {
                handle,
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
    }
    .unwrap();
    mp.get_number_of_processors().unwrap().enabled as u64
}

/// Debug prints the address of this module.
fn print_image_info() {
    let st = system_table();
    let bs = st.boot_services();
    // Safety: The protocol and handle remain valid indefinitely.
    let loaded_image = unsafe {
        bs.open_protocol::<LoadedImage>(
            OpenProtocolParams {
                handle: bs.image_handle(),
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
        .unwrap()
    };
    let (image_base, image_size) = loaded_image.info();
    info!("rhv image range {:#x} - {:#x}", image_base as u64, image_base as u64 + image_size);
}

/// Computes how many pages are needed for the given bytes.
fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}
