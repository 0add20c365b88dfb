use super::*;
use sqlite_hook_bridge::{LogCallback, Sqlite3Hooks, Sqlite3Log};

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Hooks for LibSqlite3 {
    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        (self.fns.update_hook)(db.as_ptr(), callback, user_data);
        Ok(())
    }

    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        (self.fns.commit_hook)(db.as_ptr(), callback, user_data);
        Ok(())
    }

    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        (self.fns.rollback_hook)(db.as_ptr(), callback, user_data);
        Ok(())
    }

    unsafe fn trace(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<TraceCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let Some(trace) = self.fns.trace else {
            return Err(Error::feature_unavailable("sqlite3_trace not available"));
        };
        trace(db.as_ptr(), callback, user_data);
        Ok(())
    }

    unsafe fn profile(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<ProfileCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let Some(profile) = self.fns.profile else {
            return Err(Error::feature_unavailable("sqlite3_profile not available"));
        };
        profile(db.as_ptr(), callback, user_data);
        Ok(())
    }

    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n_ops: i32,
        callback: Option<ProgressCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let Some(progress) = self.fns.progress_handler else {
            return Err(Error::feature_unavailable(
                "sqlite3_progress_handler not available",
            ));
        };
        progress(db.as_ptr(), n_ops, callback, user_data);
        Ok(())
    }

    unsafe fn set_authorizer(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<AuthorizerCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let Some(set) = self.fns.set_authorizer else {
            return Err(Error::feature_unavailable(
                "sqlite3_set_authorizer not available",
            ));
        };
        let rc = set(db.as_ptr(), callback, user_data);
        self.check(rc, Some(db))
    }

    unsafe fn exec(
        &self,
        db: NonNull<Self::Db>,
        sql: &str,
        callback: Option<ExecCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let sql = c_text(sql, "sql")?;
        let mut errmsg = null_mut();
        let rc = (self.fns.exec)(
            db.as_ptr(),
            sql.as_ptr() as *const c_char,
            callback,
            user_data,
            &mut errmsg,
        );
        let message = self.take_message(errmsg);
        if rc == SQLITE_OK {
            return Ok(());
        }
        let extended = self.fns.extended_errcode.map(|f| f(db.as_ptr()));
        Err(Error::from_code(rc, message, extended))
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Log for LibSqlite3 {
    unsafe fn config_log(
        &self,
        callback: Option<LogCallback>,
        user_data: *mut c_void,
    ) -> Result<()> {
        let Some(config) = self.fns.config else {
            return Err(Error::feature_unavailable("sqlite3_config not available"));
        };
        let callback = callback.map_or(std::ptr::null(), |f| f as *const c_void);
        // Fails with SQLITE_MISUSE once the library has initialized.
        let rc = config(SQLITE_CONFIG_LOG, callback, user_data);
        self.check(rc, None)
    }
}
