//! Provides a minimal rust wrapper for the parts of the NI-DAQmx C library used for playback.
//!
//! ## Overview
//!
//! The core of this module is the [`NiTask`] struct which represents an NI-DAQmx task. It encapsulates
//! a handle to an NI-DAQmx task and provides methods that map to DAQmx C-functions: creating analog
//! and digital output channels, configuring the sample clock, writing buffers, and starting/waiting
//! on the task.
//!
//! **Refer to implementations of the [`NiTask`] struct to see the wrapped methods and invoked
//! [DAQmx C-functions](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)**
//!
//! ## Error Handling
//!
//! Every DAQmx call goes through [`daqmx_call`], which turns a negative status code into a
//! [`DaqmxError`] carrying the driver's extended error message. Errors are returned to the caller,
//! never retried. In addition to being returned, NI-DAQmx driver errors are appended to the
//! `nidaqmx_error.logs` file in the directory of the calling shell.
//!
//! ## Cleanup and Resource Management
//!
//! The `NiTask` struct implements the `Drop` trait, clearing the DAQmx task handle when an instance
//! goes out of scope.
//!
//! This module is only built with the `nidaqmx` feature, which links against the `NIDAQmx` library.

use std::fs::OpenOptions;
use std::io::Write;

use libc;
use ndarray::{Array1, Array2};

use crate::error::DaqmxError;

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_GROUPBYSCANNUMBER: CBool32 = 1;
pub const DAQMX_VAL_WAITINFINITELY: CFloat64 = -1.0;
pub const DAQMX_VAL_CHANFORALLLINES: CInt32 = 1;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxWaitUntilTaskDone(handle: TaskHandle, timeToWait: CFloat64) -> CInt32;
    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateDOChan(
        handle: TaskHandle,
        lines: CConstStr,
        name: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;

    fn DAQmxWriteDigitalU32(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const u32,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

fn log_error(error_string: &str) {
    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./nidaqmx_error.logs")
        .and_then(|mut file| writeln!(file, "DAQmx Error: {}", error_string));
    if let Err(e) = logged {
        tracing::warn!("Failed to write nidaqmx_error.logs: {}", e);
    }
}

/// Calls a DAQmx C-function and converts a negative status into a [`DaqmxError`].
///
/// Every DAQmx C-function returns an `int32` which, if negative, indicates an error. The extended
/// error information is then retrieved with `DAQmxGetExtendedErrorInfo`, appended to
/// `nidaqmx_error.logs`, and returned.
///
/// ```ignore
/// daqmx_call(|| unsafe { DAQmxSomeFunction(param1, param2) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<(), DaqmxError> {
    let err_code = func();
    if err_code >= 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let error_string = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    log_error(&error_string);
    tracing::warn!("DAQmx Error {}: {}", err_code, error_string);
    Err(DaqmxError {
        code: err_code,
        message: error_string,
    })
}

fn to_cstring(value: &str) -> Result<std::ffi::CString, DaqmxError> {
    std::ffi::CString::new(value).map_err(|e| DaqmxError {
        code: -1,
        message: format!("invalid name {:?}: {}", value, e),
    })
}

/// Resets a National Instruments (NI) device by name (e.g. `"Dev1"`).
pub fn reset_ni_device(name: &str) -> Result<(), DaqmxError> {
    let name_cstr = to_cstring(name)?;
    daqmx_call(|| unsafe { DAQmxResetDevice(name_cstr.as_ptr()) })
}

/// Represents a National Instruments (NI) DAQmx task.
///
/// Creating an instance corresponds to creating a new NI-DAQmx task; the task is cleared on drop.
pub struct NiTask {
    handle: TaskHandle,
}

// The handle is only used through DAQmx calls, which are thread-safe
unsafe impl Send for NiTask {}

impl NiTask {
    pub fn new() -> Result<Self, DaqmxError> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = to_cstring("")?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })?;
        Ok(Self { handle: taskhandle })
    }

    pub fn clear(&self) -> Result<(), DaqmxError> {
        daqmx_call(|| unsafe { DAQmxClearTask(self.handle) })
    }
    pub fn start(&self) -> Result<(), DaqmxError> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }
    pub fn stop(&self) -> Result<(), DaqmxError> {
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) })
    }
    pub fn wait_until_done(&self, timeout: f64) -> Result<(), DaqmxError> {
        daqmx_call(|| unsafe { DAQmxWaitUntilTaskDone(self.handle, timeout as CFloat64) })
    }

    /// Finite generation of `seq_len` samples at `samp_rate`; an empty `clk_src` selects the
    /// device's onboard clock.
    pub fn cfg_sample_clk(&self, clk_src: &str, samp_rate: f64, seq_len: u64) -> Result<(), DaqmxError> {
        let src_cstring = to_cstring(clk_src)?;
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                seq_len as CUint64,
            )
        })
    }

    pub fn create_ao_chan(&self, name: &str) -> Result<(), DaqmxError> {
        let name_cstr = to_cstring(name)?;
        let assigned_name_cstr = to_cstring("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                -10.,
                10.,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
    }

    pub fn create_do_chan(&self, name: &str) -> Result<(), DaqmxError> {
        let name_cstr = to_cstring(name)?;
        let assigned_name_cstr = to_cstring("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateDOChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CHANFORALLLINES,
            )
        })
    }

    /// Writes one port value per sample.
    pub fn write_digital_port(&self, signal_arr: &Array1<u32>) -> Result<usize, DaqmxError> {
        let signal_arr = signal_arr.as_standard_layout();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteDigitalU32(
                self.handle,
                signal_arr.len() as CInt32,
                false as CBool32,
                DAQMX_VAL_WAITINFINITELY,
                DAQMX_VAL_GROUPBYSCANNUMBER,
                signal_arr.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    /// Writes a `samples × channels` buffer (interleaved by scan).
    pub fn write_analog(&self, signal_arr: &Array2<f64>) -> Result<usize, DaqmxError> {
        let signal_arr = signal_arr.as_standard_layout();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                signal_arr.shape()[0] as CInt32,
                false as CBool32,
                DAQMX_VAL_WAITINFINITELY,
                DAQMX_VAL_GROUPBYSCANNUMBER,
                signal_arr.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            tracing::warn!("Failed to clear DAQmx task: {}", e);
        }
    }
}
