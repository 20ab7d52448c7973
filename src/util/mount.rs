use anyhow::{Context, Result, anyhow};
use nix::mount::MsFlags;
use std::ffi::CStr;
use std::ffi::CString;
use std::path::Path;

/**
 * Thin wrapper around mount(2) that accepts anything path-like and reports
 * the full mount request on failure.
 */
pub fn mount<S1, S2, S3, S4>(
    source: Option<S1>,
    target: S2,
    fstype: Option<S3>,
    flags: MsFlags,
    data: Option<S4>,
) -> Result<()>
where
    S1: AsRef<std::ffi::OsStr>,
    S2: AsRef<std::ffi::OsStr>,
    S3: AsRef<std::ffi::OsStr>,
    S4: AsRef<std::ffi::OsStr>,
{
    let source_cstr = match &source {
        Some(source) => {
            CString::new(source.as_ref().to_string_lossy().as_bytes())?
        }
        None => CString::new("")?,
    };
    let target_cstr =
        CString::new(target.as_ref().to_string_lossy().as_bytes())?;
    let fstype_cstr = match &fstype {
        Some(fstype) => {
            CString::new(fstype.as_ref().to_string_lossy().as_bytes())?
        }
        None => CString::new("")?,
    };
    let data_cstr = match &data {
        Some(data) => CString::new(data.as_ref().to_string_lossy().as_bytes())?,
        None => CString::new("")?,
    };

    let source = source.map(|_| source_cstr.as_c_str());
    let target = target_cstr.as_c_str();
    let fstype = fstype.map(|_| fstype_cstr.as_c_str());
    let data = data.map(|_| data_cstr.as_c_str());

    let result = nix::mount::mount::<CStr, CStr, CStr, CStr>(
        source, target, fstype, flags, data,
    );

    if let Err(e) = result {
        let err_context = format!(
            "failed to mount {} {} [type={}, flags={}, data={}]",
            source_cstr.to_string_lossy(),
            target_cstr.to_string_lossy(),
            fstype_cstr.to_string_lossy(),
            flags.bits(),
            data_cstr.to_string_lossy(),
        );

        /* EINVAL on an overlay whose lower is / almost always means the
         * kernel's overlayfs stacking depth (2 by default) was exceeded,
         * which produces a uselessly generic errno. */
        if e == nix::errno::Errno::EINVAL
            && fstype_cstr.to_string_lossy() == "overlay"
            && data
                .map(|d| d.to_string_lossy().contains("lowerdir=/"))
                .unwrap_or(false)
        {
            return Err(anyhow!(
                "Maximum overlayfs stacking depth exceeded. \
                The kernel refuses to stack an overlay filesystem on a lower \
                directory that is already more than one overlay deep."
            ))
            .context(err_context);
        }

        return Err(e).context(err_context);
    }

    Ok(())
}

/**
 * Overlay mount options are a comma separated string; a path containing a
 * comma (or other unusual characters) would silently corrupt them, so
 * restrict what we accept.
 */
pub fn check_path_for_mount_option_compatibility(path: &Path) -> Result<()> {
    if path.components().count() == 0 {
        return Err(anyhow!("Path {} is empty", path.display()));
    }

    path.components().try_for_each(|component| {
        let component_str = match component.as_os_str().to_str() {
            Some(s) => s,
            None => {
                return Err(anyhow!(
                    "Path {} contains invalid character",
                    path.display(),
                ));
            }
        };

        if !component_str.chars().all(|c| {
            c.is_alphanumeric()
                || c == '_'
                || c == '-'
                || c == '.'
                || c == '/'
                || c == '@'
                || c == '%'
        }) {
            Err(anyhow!(
                "Path {} contains invalid character {}",
                path.display(),
                component_str
            ))
        } else {
            Ok(())
        }
    })
}
