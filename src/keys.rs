pub const JOB_METADATA_PREFIX: &str = "jobs/";
pub const ASG_INSTANCE_PREFIX: &str = "asg/";

/// Key of a job's metadata record.
pub fn job_metadata_key(job_key: &str) -> String {
    format!("{JOB_METADATA_PREFIX}{job_key}")
}

/// Key of an instance's termination record.
pub fn asg_instance_key(instance_name: &str) -> String {
    format!("{ASG_INSTANCE_PREFIX}{instance_name}")
}

/// Inclusive scan bounds covering every key under `prefix`.
pub fn prefix_range(prefix: &str) -> (Vec<u8>, Vec<u8>) {
    let start = prefix.as_bytes().to_vec();
    let mut end = start.clone();
    end.push(0xFF);
    (start, end)
}
