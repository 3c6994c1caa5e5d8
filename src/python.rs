//! CPython object layouts.
//!
//! Mirror structs of the interpreter's C object headers, selected at build
//! time by the `python2`/`python3` features. Nothing here is ever
//! instantiated; the structs exist so `offset_of!` can turn a remote object's
//! base address into the addresses of the fields the walker reads. Pointer
//! fields are declared as `usize` since they only ever hold addresses in the
//! target's address space.

use memoffset::offset_of;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "python2", feature = "python3"))] {
        compile_error!("features `python2` and `python3` are mutually exclusive");
    } else if #[cfg(feature = "python2")] {
        use libc::{c_char, c_int, c_long};

        /// `PyStringObject`, CPython 2.7.
        #[repr(C)]
        #[allow(dead_code)]
        struct PyStringObject {
            ob_refcnt: isize,
            ob_type: usize,
            ob_size: isize,
            ob_shash: c_long,
            ob_sstate: c_int,
            ob_sval: [c_char; 1],
        }

        /// `struct _ts`, CPython 2.7 (prefix only).
        #[repr(C)]
        #[allow(dead_code)]
        struct PyThreadState {
            next: usize,
            interp: usize,
            frame: usize,
        }

        /// `struct _frame`, CPython 2.7 (prefix only).
        #[repr(C)]
        #[allow(dead_code)]
        struct PyFrameObject {
            ob_refcnt: isize,
            ob_type: usize,
            ob_size: isize,
            f_back: usize,
            f_code: usize,
            f_builtins: usize,
            f_globals: usize,
            f_locals: usize,
            f_valuestack: usize,
            f_stacktop: usize,
            f_trace: usize,
            f_exc_type: usize,
            f_exc_value: usize,
            f_exc_traceback: usize,
            f_tstate: usize,
            f_lasti: c_int,
            f_lineno: c_int,
        }

        /// `PyCodeObject`, CPython 2.7 (prefix only).
        #[repr(C)]
        #[allow(dead_code)]
        struct PyCodeObject {
            ob_refcnt: isize,
            ob_type: usize,
            co_argcount: c_int,
            co_nlocals: c_int,
            co_stacksize: c_int,
            co_flags: c_int,
            co_code: usize,
            co_consts: usize,
            co_names: usize,
            co_varnames: usize,
            co_freevars: usize,
            co_cellvars: usize,
            co_filename: usize,
            co_name: usize,
            co_firstlineno: c_int,
        }

        /// Address of the string's byte count.
        pub fn string_size(addr: usize) -> usize {
            addr + offset_of!(PyStringObject, ob_size)
        }

        /// Address of the string's inline character buffer.
        pub fn string_data(addr: usize) -> usize {
            addr + offset_of!(PyStringObject, ob_sval)
        }

        pub fn thread_state_frame(addr: usize) -> usize {
            addr + offset_of!(PyThreadState, frame)
        }

        pub fn frame_back(addr: usize) -> usize {
            addr + offset_of!(PyFrameObject, f_back)
        }

        pub fn frame_code(addr: usize) -> usize {
            addr + offset_of!(PyFrameObject, f_code)
        }

        pub fn frame_lineno(addr: usize) -> usize {
            addr + offset_of!(PyFrameObject, f_lineno)
        }

        pub fn code_filename(addr: usize) -> usize {
            addr + offset_of!(PyCodeObject, co_filename)
        }
    } else if #[cfg(feature = "python3")] {
        use libc::c_int;

        /// `PyVarObject`.
        #[repr(C)]
        #[allow(dead_code)]
        struct PyVarObject {
            ob_refcnt: isize,
            ob_type: usize,
            ob_size: isize,
        }

        /// `PyASCIIObject`, CPython 3.5/3.6. The trailing `state` bitfield
        /// packs into one 32-bit unit; `wstr` realigns to the word boundary,
        /// so the struct size matches the C header.
        #[repr(C)]
        #[allow(dead_code)]
        struct PyAsciiObject {
            ob_refcnt: isize,
            ob_type: usize,
            length: isize,
            hash: isize,
            state: u32,
            wstr: usize,
        }

        /// `struct _ts`, CPython 3.5/3.6 (prefix only).
        #[repr(C)]
        #[allow(dead_code)]
        struct PyThreadState {
            prev: usize,
            next: usize,
            interp: usize,
            frame: usize,
        }

        /// `struct _frame`, CPython 3.5/3.6 (prefix only).
        #[repr(C)]
        #[allow(dead_code)]
        struct PyFrameObject {
            ob_refcnt: isize,
            ob_type: usize,
            ob_size: isize,
            f_back: usize,
            f_code: usize,
            f_builtins: usize,
            f_globals: usize,
            f_locals: usize,
            f_valuestack: usize,
            f_stacktop: usize,
            f_trace: usize,
            f_exc_type: usize,
            f_exc_value: usize,
            f_exc_traceback: usize,
            f_gen: usize,
            f_lasti: c_int,
            f_lineno: c_int,
        }

        /// `PyCodeObject`, CPython 3.6 (prefix only).
        #[repr(C)]
        #[allow(dead_code)]
        struct PyCodeObject {
            ob_refcnt: isize,
            ob_type: usize,
            co_argcount: c_int,
            co_kwonlyargcount: c_int,
            co_nlocals: c_int,
            co_stacksize: c_int,
            co_flags: c_int,
            co_firstlineno: c_int,
            co_code: usize,
            co_consts: usize,
            co_names: usize,
            co_varnames: usize,
            co_freevars: usize,
            co_cellvars: usize,
            co_cell2arg: usize,
            co_filename: usize,
            co_name: usize,
        }

        /// Address of the string's code-point count.
        pub fn string_size(addr: usize) -> usize {
            addr + offset_of!(PyVarObject, ob_size)
        }

        /// Address of the string's character data.
        ///
        /// This works only if the string is a compact ASCII object; wide and
        /// legacy kinds put the data elsewhere.
        pub fn string_data(addr: usize) -> usize {
            addr + std::mem::size_of::<PyAsciiObject>()
        }

        pub fn thread_state_frame(addr: usize) -> usize {
            addr + offset_of!(PyThreadState, frame)
        }

        pub fn frame_back(addr: usize) -> usize {
            addr + offset_of!(PyFrameObject, f_back)
        }

        pub fn frame_code(addr: usize) -> usize {
            addr + offset_of!(PyFrameObject, f_code)
        }

        pub fn frame_lineno(addr: usize) -> usize {
            addr + offset_of!(PyFrameObject, f_lineno)
        }

        pub fn code_filename(addr: usize) -> usize {
            addr + offset_of!(PyCodeObject, co_filename)
        }
    } else {
        compile_error!("one of the `python2` or `python3` features must be enabled");
    }
}
