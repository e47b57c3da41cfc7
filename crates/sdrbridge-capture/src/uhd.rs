//! UHD backend over the UHD C API.
//!
//! Only the handful of `multi_usrp` calls the bridge needs are bound here.
//! Every driver call blocks, so each one runs on tokio's blocking pool.
//! Configuration calls and streaming calls take separate locks, which lets
//! the control session retune while a block is being received.

use async_trait::async_trait;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use sdrbridge_core::capture::{CaptureSource, RecvResult, RecvStatus};
use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::types::{ClockSource, DeviceInfo, IqSample, RateRange};

// UHD C API FFI bindings (manual, minimal)

type UhdError = c_int;
const UHD_ERROR_NONE: UhdError = 0;

type UhdUsrpHandle = *mut c_void;
type UhdRxStreamerHandle = *mut c_void;
type UhdRxMetadataHandle = *mut c_void;
type UhdMetaRangeHandle = *mut c_void;
type UhdSubdevSpecHandle = *mut c_void;

const UHD_TUNE_REQUEST_POLICY_AUTO: c_int = 65;

const UHD_STREAM_MODE_NUM_SAMPS_AND_DONE: c_int = 100;
const UHD_STREAM_MODE_STOP_CONTINUOUS: c_int = 111;

const UHD_RX_METADATA_ERROR_CODE_NONE: c_int = 0x0;
const UHD_RX_METADATA_ERROR_CODE_TIMEOUT: c_int = 0x1;
const UHD_RX_METADATA_ERROR_CODE_OVERFLOW: c_int = 0x8;

#[repr(C)]
struct UhdTuneRequest {
    target_freq: c_double,
    rf_freq_policy: c_int,
    rf_freq: c_double,
    dsp_freq_policy: c_int,
    dsp_freq: c_double,
    args: *mut c_char,
}

#[repr(C)]
#[derive(Default)]
struct UhdTuneResult {
    clipped_rf_freq: c_double,
    target_rf_freq: c_double,
    actual_rf_freq: c_double,
    target_dsp_freq: c_double,
    actual_dsp_freq: c_double,
}

#[repr(C)]
struct UhdStreamArgs {
    cpu_format: *mut c_char,
    otw_format: *mut c_char,
    args: *mut c_char,
    channel_list: *mut usize,
    n_channels: c_int,
}

#[repr(C)]
struct UhdStreamCmd {
    stream_mode: c_int,
    num_samps: usize,
    stream_now: bool,
    time_spec_full_secs: i64,
    time_spec_frac_secs: c_double,
}

#[repr(C)]
struct UhdRxInfo {
    mboard_id: *mut c_char,
    mboard_name: *mut c_char,
    mboard_serial: *mut c_char,
    rx_id: *mut c_char,
    rx_subdev_name: *mut c_char,
    rx_subdev_spec: *mut c_char,
    rx_serial: *mut c_char,
    rx_antenna: *mut c_char,
}

unsafe extern "C" {
    fn uhd_get_last_error(error_out: *mut c_char, strbuffer_len: usize) -> UhdError;

    fn uhd_usrp_make(h: *mut UhdUsrpHandle, args: *const c_char) -> UhdError;
    fn uhd_usrp_free(h: *mut UhdUsrpHandle) -> UhdError;
    fn uhd_usrp_get_rx_info(h: UhdUsrpHandle, chan: usize, info_out: *mut UhdRxInfo) -> UhdError;
    fn uhd_usrp_rx_info_free(rx_info: *mut UhdRxInfo) -> UhdError;

    fn uhd_usrp_set_clock_source(h: UhdUsrpHandle, source: *const c_char, mboard: usize)
    -> UhdError;
    fn uhd_usrp_set_rx_subdev_spec(
        h: UhdUsrpHandle,
        subdev_spec: UhdSubdevSpecHandle,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_rx_antenna(h: UhdUsrpHandle, ant: *const c_char, chan: usize) -> UhdError;

    fn uhd_usrp_set_rx_gain(
        h: UhdUsrpHandle,
        gain: c_double,
        chan: usize,
        gain_name: *const c_char,
    ) -> UhdError;
    fn uhd_usrp_get_rx_gain(
        h: UhdUsrpHandle,
        chan: usize,
        gain_name: *const c_char,
        gain_out: *mut c_double,
    ) -> UhdError;
    fn uhd_usrp_set_rx_bandwidth(h: UhdUsrpHandle, bandwidth: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_get_rx_bandwidth(h: UhdUsrpHandle, chan: usize, out: *mut c_double) -> UhdError;
    fn uhd_usrp_set_rx_freq(
        h: UhdUsrpHandle,
        tune_request: *mut UhdTuneRequest,
        chan: usize,
        tune_result: *mut UhdTuneResult,
    ) -> UhdError;
    fn uhd_usrp_get_rx_freq(h: UhdUsrpHandle, chan: usize, out: *mut c_double) -> UhdError;
    fn uhd_usrp_set_rx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_get_rx_rate(h: UhdUsrpHandle, chan: usize, out: *mut c_double) -> UhdError;
    fn uhd_usrp_get_rx_rates(h: UhdUsrpHandle, chan: usize, rates_out: UhdMetaRangeHandle)
    -> UhdError;

    fn uhd_meta_range_make(h: *mut UhdMetaRangeHandle) -> UhdError;
    fn uhd_meta_range_free(h: *mut UhdMetaRangeHandle) -> UhdError;
    fn uhd_meta_range_start(h: UhdMetaRangeHandle, out: *mut c_double) -> UhdError;
    fn uhd_meta_range_stop(h: UhdMetaRangeHandle, out: *mut c_double) -> UhdError;
    fn uhd_meta_range_step(h: UhdMetaRangeHandle, out: *mut c_double) -> UhdError;

    fn uhd_subdev_spec_make(h: *mut UhdSubdevSpecHandle, markup: *const c_char) -> UhdError;
    fn uhd_subdev_spec_free(h: *mut UhdSubdevSpecHandle) -> UhdError;

    fn uhd_usrp_get_rx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdRxStreamerHandle,
    ) -> UhdError;
    fn uhd_rx_streamer_make(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_free(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_recv(
        h: UhdRxStreamerHandle,
        buffs: *mut *mut c_void,
        samps_per_buff: usize,
        md: *mut UhdRxMetadataHandle,
        timeout: c_double,
        one_packet: bool,
        items_recvd: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_issue_stream_cmd(
        h: UhdRxStreamerHandle,
        stream_cmd: *const UhdStreamCmd,
    ) -> UhdError;

    fn uhd_rx_metadata_make(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_free(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_error_code(h: UhdRxMetadataHandle, error_code_out: *mut c_int) -> UhdError;
}

/// Largest number of samples pulled from the streamer in one receive call.
const RECV_CHUNK_SAMPLES: usize = 64 * 1024;

/// Receive timeout used while draining an abandoned request.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// The only RX channel the bridge uses.
const CHANNEL: usize = 0;

/// Turn a UHD return code into a [`Result`], attaching UHD's last error text.
fn check(err: UhdError, what: &str) -> Result<()> {
    if err == UHD_ERROR_NONE {
        return Ok(());
    }
    let mut buf = [0 as c_char; 512];
    // SAFETY: `buf` is writable for `buf.len()` bytes and UHD NUL-terminates.
    let detail = unsafe {
        uhd_get_last_error(buf.as_mut_ptr(), buf.len());
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    };
    Err(Error::Device(format!("{} failed (code {}): {}", what, err, detail)))
}

fn c_string(what: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::InvalidParameter(format!("{} contains a NUL byte", what)))
}

/// Owned `multi_usrp` handle.
struct Usrp(UhdUsrpHandle);

// SAFETY: the handle is only used while holding the owning mutex.
unsafe impl Send for Usrp {}

impl Drop for Usrp {
    fn drop(&mut self) {
        // SAFETY: the handle came from uhd_usrp_make and is freed once.
        unsafe {
            uhd_usrp_free(&mut self.0);
        }
    }
}

/// Samples still owed by the last `NUM_SAMPS_AND_DONE` request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Outstanding(usize);

impl Outstanding {
    fn requested(&mut self, num_samples: usize) {
        self.0 = num_samples;
    }

    fn received(&mut self, count: usize) {
        self.0 = self.0.saturating_sub(count);
    }

    /// Whether a previous block ended before its request was satisfied.
    fn is_pending(&self) -> bool {
        self.0 > 0
    }
}

/// Owned RX streamer plus its metadata object.
struct RxStream {
    streamer: UhdRxStreamerHandle,
    md: UhdRxMetadataHandle,
    outstanding: Outstanding,
}

// SAFETY: as for `Usrp`.
unsafe impl Send for RxStream {}

impl Drop for RxStream {
    fn drop(&mut self) {
        // SAFETY: both handles were made by the matching *_make calls.
        unsafe {
            uhd_rx_metadata_free(&mut self.md);
            uhd_rx_streamer_free(&mut self.streamer);
        }
    }
}

impl RxStream {
    fn recv(&mut self, buf: &mut [IqSample], timeout: Duration) -> RecvResult {
        let mut num_rx: usize = 0;
        let mut buf_ptr = buf.as_mut_ptr() as *mut c_void;

        // SAFETY: `buf` holds `buf.len()` fc32 complex samples, which is
        // exactly the layout of `Complex32`.
        let err = unsafe {
            uhd_rx_streamer_recv(
                self.streamer,
                &mut buf_ptr,
                buf.len(),
                &mut self.md,
                timeout.as_secs_f64(),
                false,
                &mut num_rx,
            )
        };
        if err != UHD_ERROR_NONE {
            tracing::error!(code = err, "uhd_rx_streamer_recv failed");
            return RecvResult {
                count: num_rx,
                status: RecvStatus::Unknown(err),
            };
        }

        let mut code: c_int = UHD_RX_METADATA_ERROR_CODE_NONE;
        // SAFETY: `md` is a live metadata handle.
        unsafe {
            uhd_rx_metadata_error_code(self.md, &mut code);
        }

        self.outstanding.received(num_rx);
        let status = match code {
            UHD_RX_METADATA_ERROR_CODE_NONE => RecvStatus::Ok,
            UHD_RX_METADATA_ERROR_CODE_TIMEOUT => RecvStatus::Timeout,
            UHD_RX_METADATA_ERROR_CODE_OVERFLOW => RecvStatus::Overflow,
            other => RecvStatus::Unknown(other),
        };
        RecvResult {
            count: num_rx,
            status,
        }
    }

    fn issue(&mut self, stream_mode: c_int, num_samps: usize) -> Result<()> {
        let cmd = UhdStreamCmd {
            stream_mode,
            num_samps,
            stream_now: true,
            time_spec_full_secs: 0,
            time_spec_frac_secs: 0.0,
        };
        // SAFETY: the streamer is live for as long as `self` is.
        check(
            unsafe { uhd_rx_streamer_issue_stream_cmd(self.streamer, &cmd) },
            "uhd_rx_streamer_issue_stream_cmd",
        )
    }

    /// Stop a request the previous block abandoned and discard whatever
    /// it still delivers, so those samples cannot open the next block.
    fn flush_outstanding(&mut self) -> Result<()> {
        if !self.outstanding.is_pending() {
            return Ok(());
        }
        tracing::debug!(samples = self.outstanding.0, "stopping abandoned stream request");
        self.issue(UHD_STREAM_MODE_STOP_CONTINUOUS, 0)?;

        let mut scratch = vec![IqSample::default(); RECV_CHUNK_SAMPLES];
        let mut discarded = 0usize;
        loop {
            let result = self.recv(&mut scratch, DRAIN_TIMEOUT);
            discarded += result.count;
            if result.count == 0 || result.status != RecvStatus::Ok {
                break;
            }
        }
        if discarded > 0 {
            tracing::debug!(discarded, "drained late samples");
        }
        self.outstanding = Outstanding::default();
        Ok(())
    }
}

/// A UHD-driven receiver (USRP, ANTSDR).
pub struct UhdSource {
    info: DeviceInfo,
    rate_range: RateRange,
    // Declared before `usrp` so the streamer is freed first.
    rx: Arc<Mutex<RxStream>>,
    usrp: Arc<Mutex<Usrp>>,
}

impl UhdSource {
    /// Open the device described by a UHD device-argument string.
    pub async fn open(args: &str) -> Result<Self> {
        tracing::info!(device = %args, "Opening UHD device");
        let c_args = c_string("device string", args)?;

        let (usrp, rx, info, rate_range) = tokio::task::spawn_blocking(move || open_blocking(&c_args))
            .await
            .map_err(|e| Error::Device(format!("UHD open task failed: {}", e)))??;

        tracing::info!(
            model = %info.model,
            serial = %info.serial,
            min_rate = rate_range.start,
            max_rate = rate_range.stop,
            "UHD device ready"
        );

        Ok(UhdSource {
            info,
            rate_range,
            rx: Arc::new(Mutex::new(rx)),
            usrp: Arc::new(Mutex::new(usrp)),
        })
    }

    /// Run `f` against the device handle on the blocking pool.
    async fn with_usrp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(UhdUsrpHandle) -> Result<T> + Send + 'static,
    {
        let usrp = Arc::clone(&self.usrp);
        tokio::task::spawn_blocking(move || {
            let guard = usrp.blocking_lock();
            f(guard.0)
        })
        .await
        .map_err(|e| Error::Device(format!("UHD task failed: {}", e)))?
    }

    async fn get_double(
        &self,
        what: &'static str,
        getter: unsafe extern "C" fn(UhdUsrpHandle, usize, *mut c_double) -> UhdError,
    ) -> Result<f64> {
        self.with_usrp(move |h| {
            let mut out: c_double = 0.0;
            // SAFETY: `h` is live while the lock is held; `out` is writable.
            check(unsafe { getter(h, CHANNEL, &mut out) }, what)?;
            Ok(out)
        })
        .await
    }
}

type Opened = (Usrp, RxStream, DeviceInfo, RateRange);

fn open_blocking(args: &CStr) -> Result<Opened> {
    let mut handle: UhdUsrpHandle = ptr::null_mut();
    // SAFETY: `args` is NUL-terminated; `handle` receives a new handle.
    check(unsafe { uhd_usrp_make(&mut handle, args.as_ptr()) }, "uhd_usrp_make")?;
    let usrp = Usrp(handle);

    let info = rx_info(usrp.0)?;
    let rate_range = rx_rates(usrp.0)?;
    let rx = make_rx_stream(usrp.0)?;
    Ok((usrp, rx, info, rate_range))
}

fn rx_info(h: UhdUsrpHandle) -> Result<DeviceInfo> {
    let mut raw = UhdRxInfo {
        mboard_id: ptr::null_mut(),
        mboard_name: ptr::null_mut(),
        mboard_serial: ptr::null_mut(),
        rx_id: ptr::null_mut(),
        rx_subdev_name: ptr::null_mut(),
        rx_subdev_spec: ptr::null_mut(),
        rx_serial: ptr::null_mut(),
        rx_antenna: ptr::null_mut(),
    };
    // SAFETY: `raw` is filled by UHD and released with uhd_usrp_rx_info_free.
    unsafe {
        check(uhd_usrp_get_rx_info(h, CHANNEL, &mut raw), "uhd_usrp_get_rx_info")?;
        let info = DeviceInfo::new(owned(raw.mboard_name), owned(raw.mboard_serial));
        uhd_usrp_rx_info_free(&mut raw);
        Ok(info)
    }
}

/// Copy a possibly-null C string.
///
/// # Safety
/// `p` must be null or point to a NUL-terminated string.
unsafe fn owned(p: *const c_char) -> String {
    if p.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
    }
}

fn rx_rates(h: UhdUsrpHandle) -> Result<RateRange> {
    let mut range: UhdMetaRangeHandle = ptr::null_mut();
    // SAFETY: the meta range is created, queried, and freed here.
    unsafe {
        check(uhd_meta_range_make(&mut range), "uhd_meta_range_make")?;
        let (mut start, mut stop, mut step) = (0.0, 0.0, 0.0);
        let result = check(uhd_usrp_get_rx_rates(h, CHANNEL, range), "uhd_usrp_get_rx_rates")
            .and_then(|_| check(uhd_meta_range_start(range, &mut start), "uhd_meta_range_start"))
            .and_then(|_| check(uhd_meta_range_stop(range, &mut stop), "uhd_meta_range_stop"))
            .and_then(|_| check(uhd_meta_range_step(range, &mut step), "uhd_meta_range_step"));
        uhd_meta_range_free(&mut range);
        result.map(|_| RateRange::new(start, stop, step))
    }
}

fn make_rx_stream(h: UhdUsrpHandle) -> Result<RxStream> {
    let mut rx = RxStream {
        streamer: ptr::null_mut(),
        md: ptr::null_mut(),
        outstanding: Outstanding::default(),
    };
    // SAFETY: handles are created into `rx`, whose Drop frees them on any
    // early return below.
    unsafe {
        check(uhd_rx_streamer_make(&mut rx.streamer), "uhd_rx_streamer_make")?;
        check(uhd_rx_metadata_make(&mut rx.md), "uhd_rx_metadata_make")?;

        let mut channel: usize = CHANNEL;
        let mut stream_args = UhdStreamArgs {
            cpu_format: c"fc32".as_ptr() as *mut c_char,
            otw_format: c"sc16".as_ptr() as *mut c_char,
            args: c"".as_ptr() as *mut c_char,
            channel_list: &mut channel,
            n_channels: 1,
        };
        check(
            uhd_usrp_get_rx_stream(h, &mut stream_args, rx.streamer),
            "uhd_usrp_get_rx_stream",
        )?;
    }
    Ok(rx)
}

#[async_trait]
impl CaptureSource for UhdSource {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn select_frontend(&self, subdev: &str, antenna: &str) -> Result<()> {
        let spec = c_string("subdev spec", subdev)?;
        let ant = c_string("antenna", antenna)?;
        self.with_usrp(move |h| {
            let mut handle: UhdSubdevSpecHandle = ptr::null_mut();
            // SAFETY: the subdev spec handle is created, applied, and freed here.
            unsafe {
                check(
                    uhd_subdev_spec_make(&mut handle, spec.as_ptr()),
                    "uhd_subdev_spec_make",
                )?;
                let applied = check(
                    uhd_usrp_set_rx_subdev_spec(h, handle, 0),
                    "uhd_usrp_set_rx_subdev_spec",
                );
                uhd_subdev_spec_free(&mut handle);
                applied?;
                check(
                    uhd_usrp_set_rx_antenna(h, ant.as_ptr(), CHANNEL),
                    "uhd_usrp_set_rx_antenna",
                )
            }
        })
        .await
    }

    async fn set_clock_source(&self, source: ClockSource) -> Result<()> {
        let name = c_string("clock source", source.as_str())?;
        self.with_usrp(move |h| {
            // SAFETY: `h` is live while the lock is held.
            check(
                unsafe { uhd_usrp_set_clock_source(h, name.as_ptr(), 0) },
                "uhd_usrp_set_clock_source",
            )
        })
        .await
    }

    async fn set_rx_gain(&self, gain_db: f64) -> Result<()> {
        self.with_usrp(move |h| {
            // SAFETY: `h` is live while the lock is held.
            check(
                unsafe { uhd_usrp_set_rx_gain(h, gain_db, CHANNEL, c"".as_ptr()) },
                "uhd_usrp_set_rx_gain",
            )
        })
        .await
    }

    async fn rx_gain(&self) -> Result<f64> {
        self.with_usrp(|h| {
            let mut out: c_double = 0.0;
            // SAFETY: `h` is live while the lock is held.
            check(
                unsafe { uhd_usrp_get_rx_gain(h, CHANNEL, c"".as_ptr(), &mut out) },
                "uhd_usrp_get_rx_gain",
            )?;
            Ok(out)
        })
        .await
    }

    async fn set_rx_bandwidth(&self, bandwidth_hz: f64) -> Result<()> {
        self.with_usrp(move |h| {
            // SAFETY: `h` is live while the lock is held.
            check(
                unsafe { uhd_usrp_set_rx_bandwidth(h, bandwidth_hz, CHANNEL) },
                "uhd_usrp_set_rx_bandwidth",
            )
        })
        .await
    }

    async fn rx_bandwidth(&self) -> Result<f64> {
        self.get_double("uhd_usrp_get_rx_bandwidth", uhd_usrp_get_rx_bandwidth)
            .await
    }

    async fn set_rx_frequency(&self, freq_hz: f64) -> Result<()> {
        self.with_usrp(move |h| {
            let mut request = UhdTuneRequest {
                target_freq: freq_hz,
                rf_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
                rf_freq: 0.0,
                dsp_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
                dsp_freq: 0.0,
                args: ptr::null_mut(),
            };
            let mut result = UhdTuneResult::default();
            // SAFETY: `h` is live; request and result outlive the call.
            check(
                unsafe { uhd_usrp_set_rx_freq(h, &mut request, CHANNEL, &mut result) },
                "uhd_usrp_set_rx_freq",
            )?;
            tracing::trace!(
                rf = result.actual_rf_freq,
                dsp = result.actual_dsp_freq,
                "Tune result"
            );
            Ok(())
        })
        .await
    }

    async fn rx_frequency(&self) -> Result<f64> {
        self.get_double("uhd_usrp_get_rx_freq", uhd_usrp_get_rx_freq).await
    }

    async fn set_rx_rate(&self, rate_hz: f64) -> Result<()> {
        self.with_usrp(move |h| {
            // SAFETY: `h` is live while the lock is held.
            check(
                unsafe { uhd_usrp_set_rx_rate(h, rate_hz, CHANNEL) },
                "uhd_usrp_set_rx_rate",
            )
        })
        .await
    }

    async fn rx_rate(&self) -> Result<f64> {
        self.get_double("uhd_usrp_get_rx_rate", uhd_usrp_get_rx_rate).await
    }

    fn rx_rate_range(&self) -> RateRange {
        self.rate_range
    }

    async fn request_block(&self, num_samples: usize) -> Result<()> {
        let rx = Arc::clone(&self.rx);
        tokio::task::spawn_blocking(move || {
            let mut guard = rx.blocking_lock();
            guard.flush_outstanding()?;
            guard.issue(UHD_STREAM_MODE_NUM_SAMPS_AND_DONE, num_samples)?;
            guard.outstanding.requested(num_samples);
            Ok(())
        })
        .await
        .map_err(|e| Error::Device(format!("UHD task failed: {}", e)))?
    }

    async fn receive(&self, buf: &mut [IqSample], timeout: Duration) -> RecvResult {
        let want = buf.len().min(RECV_CHUNK_SAMPLES);
        let rx = Arc::clone(&self.rx);
        let joined = tokio::task::spawn_blocking(move || {
            let mut scratch = vec![IqSample::default(); want];
            let result = rx.blocking_lock().recv(&mut scratch, timeout);
            (result, scratch)
        })
        .await;

        match joined {
            Ok((result, scratch)) => {
                let n = result.count.min(want);
                buf[..n].copy_from_slice(&scratch[..n]);
                RecvResult {
                    count: n,
                    status: result.status,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "UHD receive task failed");
                RecvResult {
                    count: 0,
                    status: RecvStatus::Unknown(-1),
                }
            }
        }
    }
}
