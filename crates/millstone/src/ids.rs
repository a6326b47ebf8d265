
define_id_type!(JobId, u64);
define_id_type!(UserId, u64);
