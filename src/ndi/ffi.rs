//! Runtime-loaded NDI SDK bindings.
//!
//! Struct layouts match `Processing.NDI.Lib.h` (SDK v5/v6; the ABI of
//! the structures used here is unchanged between them). The runtime is
//! searched in the standard install locations per platform and loaded
//! with `libloading`, so there is no compile-time SDK dependency.

#![allow(non_snake_case)]
#![allow(dead_code)]

use std::ffi::{c_char, c_int, c_void};

use libloading::Library;
use once_cell::sync::OnceCell;

// ============================================================================
// SDK structures
// ============================================================================

/// `NDIlib_source_t`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NDIlibSource {
    pub p_ndi_name: *const c_char,
    pub p_url_address: *const c_char,
}

impl NDIlibSource {
    pub fn empty() -> Self {
        Self {
            p_ndi_name: std::ptr::null(),
            p_url_address: std::ptr::null(),
        }
    }
}

/// `NDIlib_video_frame_v2_t`
#[repr(C)]
pub struct NDIlibVideoFrameV2 {
    pub xres: c_int,
    pub yres: c_int,
    pub four_cc: c_int,
    pub frame_rate_n: c_int,
    pub frame_rate_d: c_int,
    pub picture_aspect_ratio: f32,
    pub frame_format_type: c_int,
    pub timecode: i64,
    pub p_data: *mut u8,
    /// Union with `data_size_in_bytes` in the SDK; this pipeline only
    /// handles uncompressed formats, where the stride member applies.
    pub line_stride_in_bytes: c_int,
    pub p_metadata: *const c_char,
    pub timestamp: i64,
}

impl NDIlibVideoFrameV2 {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// `NDIlib_audio_frame_v2_t` (32-bit float planar audio)
#[repr(C)]
pub struct NDIlibAudioFrameV2 {
    pub sample_rate: c_int,
    pub no_channels: c_int,
    pub no_samples: c_int,
    pub timecode: i64,
    pub p_data: *mut f32,
    pub channel_stride_in_bytes: c_int,
    pub p_metadata: *const c_char,
    pub timestamp: i64,
}

impl NDIlibAudioFrameV2 {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// `NDIlib_find_create_t`
#[repr(C)]
pub struct NDIlibFindCreate {
    pub show_local_sources: bool,
    pub p_groups: *const c_char,
    pub p_extra_ips: *const c_char,
}

/// `NDIlib_recv_create_v3_t`
#[repr(C)]
pub struct NDIlibRecvCreateV3 {
    pub source_to_connect_to: NDIlibSource,
    pub color_format: c_int,
    pub bandwidth: c_int,
    pub allow_video_fields: bool,
    pub p_ndi_recv_name: *const c_char,
}

/// `NDIlib_send_create_t`
#[repr(C)]
pub struct NDIlibSendCreate {
    pub p_ndi_name: *const c_char,
    pub p_groups: *const c_char,
    pub clock_video: bool,
    pub clock_audio: bool,
}

// Frame types returned by `NDIlib_recv_capture_v2`.
pub const FRAME_TYPE_NONE: c_int = 0;
pub const FRAME_TYPE_VIDEO: c_int = 1;
pub const FRAME_TYPE_AUDIO: c_int = 2;
pub const FRAME_TYPE_METADATA: c_int = 3;
pub const FRAME_TYPE_ERROR: c_int = 4;
pub const FRAME_TYPE_STATUS_CHANGE: c_int = 100;

/// Prefer UYVY for video, BGRA when an alpha channel is present.
pub const RECV_COLOR_FORMAT_UYVY_BGRA: c_int = 1;
pub const RECV_BANDWIDTH_HIGHEST: c_int = 100;

// Video FourCC codes.
pub const FOURCC_UYVY: u32 = 0x5956_5955;
pub const FOURCC_BGRA: u32 = 0x4152_4742;
pub const FOURCC_BGRX: u32 = 0x5852_4742;
pub const FOURCC_I420: u32 = 0x3032_3449;
pub const FOURCC_NV12: u32 = 0x3231_564E;

pub const FRAME_FORMAT_PROGRESSIVE: c_int = 1;

// ============================================================================
// Function signatures
// ============================================================================

type InitializeFn = unsafe extern "C" fn() -> bool;
type DestroyFn = unsafe extern "C" fn();
type FindCreateV2Fn = unsafe extern "C" fn(*const NDIlibFindCreate) -> *mut c_void;
type FindDestroyFn = unsafe extern "C" fn(*mut c_void);
type FindWaitForSourcesFn = unsafe extern "C" fn(*mut c_void, u32) -> bool;
type FindGetCurrentSourcesFn = unsafe extern "C" fn(*mut c_void, *mut u32) -> *const NDIlibSource;
type RecvCreateV3Fn = unsafe extern "C" fn(*const NDIlibRecvCreateV3) -> *mut c_void;
type RecvDestroyFn = unsafe extern "C" fn(*mut c_void);
type RecvConnectFn = unsafe extern "C" fn(*mut c_void, *const NDIlibSource);
type RecvCaptureV2Fn = unsafe extern "C" fn(
    *mut c_void,
    *mut NDIlibVideoFrameV2,
    *mut NDIlibAudioFrameV2,
    *mut c_void,
    u32,
) -> c_int;
type RecvFreeVideoV2Fn = unsafe extern "C" fn(*mut c_void, *mut NDIlibVideoFrameV2);
type RecvFreeAudioV2Fn = unsafe extern "C" fn(*mut c_void, *mut NDIlibAudioFrameV2);
type SendCreateFn = unsafe extern "C" fn(*const NDIlibSendCreate) -> *mut c_void;
type SendDestroyFn = unsafe extern "C" fn(*mut c_void);
type SendSendVideoV2Fn = unsafe extern "C" fn(*mut c_void, *const NDIlibVideoFrameV2);
type SendSendAudioV2Fn = unsafe extern "C" fn(*mut c_void, *const NDIlibAudioFrameV2);
type SendGetNoConnectionsFn = unsafe extern "C" fn(*mut c_void, u32) -> c_int;

// ============================================================================
// Library wrapper
// ============================================================================

/// Loaded NDI runtime entry points.
pub struct NdiLib {
    _lib: Library,
    pub initialize: InitializeFn,
    pub destroy: DestroyFn,
    pub find_create_v2: FindCreateV2Fn,
    pub find_destroy: FindDestroyFn,
    pub find_wait_for_sources: FindWaitForSourcesFn,
    pub find_get_current_sources: FindGetCurrentSourcesFn,
    pub recv_create_v3: RecvCreateV3Fn,
    pub recv_destroy: RecvDestroyFn,
    pub recv_connect: RecvConnectFn,
    pub recv_capture_v2: RecvCaptureV2Fn,
    pub recv_free_video_v2: RecvFreeVideoV2Fn,
    pub recv_free_audio_v2: RecvFreeAudioV2Fn,
    pub send_create: SendCreateFn,
    pub send_destroy: SendDestroyFn,
    pub send_send_video_v2: SendSendVideoV2Fn,
    pub send_send_audio_v2: SendSendAudioV2Fn,
    pub send_get_no_connections: SendGetNoConnectionsFn,
}

unsafe impl Send for NdiLib {}
unsafe impl Sync for NdiLib {}

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &[
    "Processing.NDI.Lib.x64.dll",
    "C:\\Program Files\\NDI\\NDI 6 SDK\\Bin\\x64\\Processing.NDI.Lib.x64.dll",
    "C:\\Program Files\\NDI\\NDI 6 Runtime\\v6\\Processing.NDI.Lib.x64.dll",
    "C:\\Program Files\\NDI\\NDI 5 SDK\\Bin\\x64\\Processing.NDI.Lib.x64.dll",
    "C:\\Program Files\\NDI\\NDI 5 Runtime\\v5\\Processing.NDI.Lib.x64.dll",
];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &[
    "/Library/NDI SDK for macOS/lib/macOS/libndi.dylib",
    "/usr/local/lib/libndi.dylib",
    "/opt/homebrew/lib/libndi.dylib",
    "libndi.dylib",
];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIB_NAMES: &[&str] = &[
    "libndi.so.6",
    "libndi.so.5",
    "libndi.so",
    "/usr/lib/libndi.so",
    "/usr/local/lib/libndi.so",
    "/usr/lib/x86_64-linux-gnu/libndi.so",
];

fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, String> {
    unsafe {
        lib.get::<T>(name)
            .map(|s| *s)
            .map_err(|e| format!("{}: {}", String::from_utf8_lossy(&name[..name.len() - 1]), e))
    }
}

fn load_library() -> Result<NdiLib, String> {
    let mut last_error = String::from("no candidate paths");
    for name in LIB_NAMES {
        match unsafe { Library::new(name) } {
            Ok(lib) => {
                let ndi = NdiLib {
                    initialize: sym(&lib, b"NDIlib_initialize\0")?,
                    destroy: sym(&lib, b"NDIlib_destroy\0")?,
                    find_create_v2: sym(&lib, b"NDIlib_find_create_v2\0")?,
                    find_destroy: sym(&lib, b"NDIlib_find_destroy\0")?,
                    find_wait_for_sources: sym(&lib, b"NDIlib_find_wait_for_sources\0")?,
                    find_get_current_sources: sym(&lib, b"NDIlib_find_get_current_sources\0")?,
                    recv_create_v3: sym(&lib, b"NDIlib_recv_create_v3\0")?,
                    recv_destroy: sym(&lib, b"NDIlib_recv_destroy\0")?,
                    recv_connect: sym(&lib, b"NDIlib_recv_connect\0")?,
                    recv_capture_v2: sym(&lib, b"NDIlib_recv_capture_v2\0")?,
                    recv_free_video_v2: sym(&lib, b"NDIlib_recv_free_video_v2\0")?,
                    recv_free_audio_v2: sym(&lib, b"NDIlib_recv_free_audio_v2\0")?,
                    send_create: sym(&lib, b"NDIlib_send_create\0")?,
                    send_destroy: sym(&lib, b"NDIlib_send_destroy\0")?,
                    send_send_video_v2: sym(&lib, b"NDIlib_send_send_video_v2\0")?,
                    send_send_audio_v2: sym(&lib, b"NDIlib_send_send_audio_v2\0")?,
                    send_get_no_connections: sym(&lib, b"NDIlib_send_get_no_connections\0")?,
                    _lib: lib,
                };

                if !unsafe { (ndi.initialize)() } {
                    return Err("NDIlib_initialize failed (CPU not supported?)".to_string());
                }
                log::info!("NDI runtime loaded from {}", name);
                return Ok(ndi);
            }
            Err(e) => last_error = format!("{}: {}", name, e),
        }
    }
    Err(last_error)
}

static NDI: OnceCell<Result<NdiLib, String>> = OnceCell::new();

/// Load and initialize the NDI runtime on first call.
pub fn load() -> Result<&'static NdiLib, String> {
    match NDI.get_or_init(load_library) {
        Ok(ndi) => Ok(ndi),
        Err(e) => Err(e.clone()),
    }
}

/// True when the NDI runtime could be loaded on this machine.
pub fn is_available() -> bool {
    load().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_probe() {
        println!("NDI runtime available: {}", is_available());
    }

    #[test]
    fn test_struct_sizes() {
        // Pointer-heavy SDK structs; a wrong field type shows up here.
        assert_eq!(
            std::mem::size_of::<NDIlibSource>(),
            2 * std::mem::size_of::<*const c_char>()
        );
        // Matches the SDK header layout on 64-bit targets.
        assert_eq!(std::mem::size_of::<NDIlibVideoFrameV2>(), 72);
        assert_eq!(std::mem::size_of::<NDIlibAudioFrameV2>(), 56);
    }
}
